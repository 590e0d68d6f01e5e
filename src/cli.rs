use crate::annotate::Annotator;
use crate::config::{config_path, load_config, save_config, Config};
use crate::detect::{self, yolo, SharedDetector, YoloDetector};
use crate::frame::Frame;
use crate::report::FrameReport;
use crate::server::{Server, ServerConfig, SourceOpener};
use crate::source;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "detect-relay",
    version,
    about = "Object detection over images, video files and cameras"
)]
pub struct Cli {
    /// ONNX model file (downloaded from the model repo when not found)
    #[arg(long, global = true)]
    pub model: Option<String>,
    /// Minimum confidence for a detection to be reported
    #[arg(long, global = true)]
    pub confidence: Option<f32>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Open the desktop window
    Gui,
    /// Run the web server
    Serve {
        /// Address to listen on
        #[arg(short, long)]
        addr: Option<String>,
        /// Directory for uploaded and annotated files
        #[arg(short, long)]
        upload_dir: Option<PathBuf>,
    },
    /// Detect objects in one image and print the report
    Detect {
        image: PathBuf,
        /// Where to write the annotated image
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print a summary of the model
    Info,
    /// Show or change the stored configuration
    Config {
        #[command(subcommand)]
        action: ConfigSubcommand,
    },
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Print the effective configuration
    Show,
    /// Set the confidence threshold
    Confidence { value: f32 },
    /// Set the model file
    Model { path: String },
    /// Set the camera device index
    Camera { index: u32 },
}

pub fn run_cli() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    if let Err(e) = execute(cli) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

pub fn execute(cli: Cli) -> Result<()> {
    let mut cfg = load_config();
    apply_overrides(&mut cfg, &cli);
    match cli.command {
        Commands::Gui => run_gui(cfg),
        Commands::Serve { addr, upload_dir } => {
            if let Some(addr) = addr {
                cfg.listen_addr = addr;
            }
            if let Some(dir) = upload_dir {
                cfg.upload_dir = dir;
            }
            serve(cfg)
        }
        Commands::Detect { image, output } => detect_image(&cfg, &image, output),
        Commands::Info => model_info(&cfg),
        Commands::Config { action } => configure(action),
    }
}

/// Applies global flags on top of the stored configuration for this run.
pub fn apply_overrides(cfg: &mut Config, cli: &Cli) {
    if let Some(model) = &cli.model {
        cfg.model = model.clone();
    }
    if let Some(conf) = cli.confidence {
        cfg.confidence = conf.clamp(0.0, 1.0);
    }
}

fn load_detector(cfg: &Config) -> Result<(YoloDetector, PathBuf)> {
    let path = yolo::resolve_model(&cfg.model, &cfg.model_repo)?;
    let detector = YoloDetector::load(&path, cfg.detector())
        .with_context(|| format!("load model {}", path.display()))?;
    Ok((detector, path))
}

fn annotator(cfg: &Config) -> Annotator {
    Annotator::new().with_font_file(cfg.font_path.as_deref())
}

#[cfg(feature = "gui")]
fn run_gui(cfg: Config) -> Result<()> {
    let (detector, _) = load_detector(&cfg)?;
    let detector: SharedDetector = detect::share(detector);
    let annotator = annotator(&cfg);
    crate::gui::run(cfg, detector, annotator);
    Ok(())
}

#[cfg(not(feature = "gui"))]
fn run_gui(_cfg: Config) -> Result<()> {
    anyhow::bail!("this build has no desktop window; rebuild with the `gui` feature")
}

fn serve(cfg: Config) -> Result<()> {
    let (detector, _) = load_detector(&cfg)?;
    let detector: SharedDetector = detect::share(detector);
    let camera_index = cfg.camera_index;
    let open_camera: SourceOpener = Arc::new(move || source::open_camera(camera_index));
    let server = Server::new(
        ServerConfig {
            addr: cfg.listen_addr.clone(),
            upload_dir: cfg.upload_dir.clone(),
            max_upload_bytes: cfg.max_upload_bytes,
            ..ServerConfig::default()
        },
        detector,
        annotator(&cfg),
        open_camera,
    );
    let mut handle = server.spawn()?;
    let shutdown = handle.shutdown_flag();
    ctrlc::set_handler(move || {
        info!("interrupt received");
        shutdown.store(true, Ordering::SeqCst);
    })
    .context("install Ctrl-C handler")?;
    println!("listening on http://{}", handle.addr);
    handle.join()
}

fn detect_image(cfg: &Config, image: &Path, output: Option<PathBuf>) -> Result<()> {
    let frame = Frame::open(image).with_context(|| format!("read {}", image.display()))?;
    let (mut detector, _) = load_detector(cfg)?;
    let start = Instant::now();
    let dets = detect::Detector::detect(&mut detector, &frame)?;
    let report = FrameReport::new(dets, start.elapsed());
    print!("{}", report.log_text());

    let output = output.unwrap_or_else(|| default_output(image));
    annotator(cfg)
        .annotate(&frame, &report.detections)
        .save(&output)
        .with_context(|| format!("write {}", output.display()))?;
    info!(path = %output.display(), "annotated image written");
    Ok(())
}

/// `photo.jpg` becomes `photo.detected.jpg` next to the input.
pub fn default_output(image: &Path) -> PathBuf {
    let stem = image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let ext = image
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "jpg".to_string());
    image.with_file_name(format!("{stem}.detected.{ext}"))
}

fn model_info(cfg: &Config) -> Result<()> {
    let path = yolo::resolve_model(&cfg.model, &cfg.model_repo)?;
    let summary = yolo::inspect(&path)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn configure(action: ConfigSubcommand) -> Result<()> {
    let mut cfg = load_config();
    match action {
        ConfigSubcommand::Show => {
            println!("{}", serde_json::to_string_pretty(&cfg)?);
            return Ok(());
        }
        ConfigSubcommand::Confidence { value } => cfg.confidence = value.clamp(0.0, 1.0),
        ConfigSubcommand::Model { path } => cfg.model = path,
        ConfigSubcommand::Camera { index } => cfg.camera_index = index,
    }
    save_config(&cfg);
    info!(path = %config_path().display(), "configuration saved");
    Ok(())
}
