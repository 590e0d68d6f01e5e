//! Web front-end: uploads, video analysis and an MJPEG camera feed.

pub mod camera;
pub mod http;

use crate::annotate::Annotator;
use crate::detect::{detect_shared, SharedDetector};
use crate::error::{Error as RelayError, Result as RelayResult};
use crate::frame::Frame;
use crate::report::{format_seconds, FrameReport, Prediction};
use crate::session::CaptureSession;
use crate::source::{self, FrameSource};
use crate::tally::LabelTally;
use anyhow::{anyhow, Context, Result};
use camera::CameraGate;
use http::{write_error, write_json, write_response, Request};
use image::ImageFormat;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::json;
use std::fs;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const INDEX_HTML: &str = include_str!("../../assets/index.html");

/// Bytes escaped when a stored file name is put into an `/uploads/` URL.
const FILE_NAME: &AsciiSet = &NON_ALPHANUMERIC.remove(b'.').remove(b'_').remove(b'-');

/// Opens the camera for one feed connection.
pub type SourceOpener = Arc<dyn Fn() -> RelayResult<Box<dyn FrameSource>> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: String,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
    /// Longest a single response write may block before the client is
    /// dropped.
    pub write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5000".to_string(),
            upload_dir: PathBuf::from("uploads"),
            max_upload_bytes: 256 * 1024 * 1024,
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Everything a connection handler needs, passed explicitly.
struct AppContext {
    cfg: ServerConfig,
    detector: SharedDetector,
    annotator: Annotator,
    open_camera: SourceOpener,
    camera: CameraGate,
    shutdown: Arc<AtomicBool>,
}

pub struct Server {
    cfg: ServerConfig,
    detector: SharedDetector,
    annotator: Annotator,
    open_camera: SourceOpener,
}

#[derive(Debug)]
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.join()
    }

    /// Blocks until the accept loop exits.
    pub fn join(&mut self) -> Result<()> {
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("server thread panicked"))?;
        }
        Ok(())
    }
}

impl Server {
    pub fn new(
        cfg: ServerConfig,
        detector: SharedDetector,
        annotator: Annotator,
        open_camera: SourceOpener,
    ) -> Self {
        Self {
            cfg,
            detector,
            annotator,
            open_camera,
        }
    }

    pub fn spawn(self) -> Result<ServerHandle> {
        fs::create_dir_all(&self.cfg.upload_dir).with_context(|| {
            format!("create upload directory {}", self.cfg.upload_dir.display())
        })?;
        let listener = TcpListener::bind(&self.cfg.addr)
            .with_context(|| format!("bind {}", self.cfg.addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        info!(%addr, upload_dir = %self.cfg.upload_dir.display(), "web server listening");

        let shutdown = Arc::new(AtomicBool::new(false));
        let ctx = Arc::new(AppContext {
            cfg: self.cfg,
            detector: self.detector,
            annotator: self.annotator,
            open_camera: self.open_camera,
            camera: CameraGate::new(),
            shutdown: shutdown.clone(),
        });
        let join = std::thread::spawn(move || {
            if let Err(err) = run_server(listener, ctx) {
                error!("web server stopped: {err}");
            }
        });
        Ok(ServerHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_server(listener: TcpListener, ctx: Arc<AppContext>) -> Result<()> {
    loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            ctx.camera.stop_all();
            info!("web server shutting down");
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let ctx = ctx.clone();
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &ctx) {
                        warn!(%peer, "request failed: {err:#}");
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, ctx: &AppContext) -> Result<()> {
    http::set_timeouts(&stream, Duration::from_secs(30), ctx.cfg.write_timeout)?;
    let req = match http::read_request(&mut stream, ctx.cfg.max_upload_bytes) {
        Ok(r) => r,
        Err(e) => {
            let _ = write_error(&mut stream, 400, &e.to_string());
            return Err(e);
        }
    };
    debug!(method = %req.method, path = %req.path, "request");

    match (req.method.as_str(), req.path.as_str()) {
        ("GET", "/") => write_response(
            &mut stream,
            200,
            "text/html; charset=utf-8",
            INDEX_HTML.as_bytes(),
        ),
        ("GET", "/health") => write_json(&mut stream, 200, &json!({ "status": "ok" })),
        ("POST", "/upload") => handle_upload(&mut stream, &req, ctx),
        ("POST", "/video") => handle_video(&mut stream, &req, ctx),
        ("GET", "/camera_feed") => stream_camera(&mut stream, ctx),
        ("POST", "/stop_camera") => {
            let was_streaming = ctx.camera.stop_all();
            info!(was_streaming, "camera stop requested");
            write_json(
                &mut stream,
                200,
                &json!({ "message": "Camera stopped successfully" }),
            )
        }
        ("GET", path) if path.starts_with("/uploads/") => {
            serve_upload(&mut stream, &path["/uploads/".len()..], ctx)
        }
        (_, "/" | "/health" | "/upload" | "/video" | "/camera_feed" | "/stop_camera") => {
            write_error(&mut stream, 405, "method not allowed")
        }
        _ => write_error(&mut stream, 404, "not found"),
    }
}

enum Upload {
    Saved { name: String, data: Vec<u8> },
    Rejected(&'static str),
}

/// Stores the `file` field of a form upload in the upload directory.
fn store_upload(req: &Request, ctx: &AppContext) -> Result<Upload> {
    let content_type = req.header("content-type").unwrap_or_default();
    let Ok(parts) = http::parse_multipart(content_type, &req.body) else {
        return Ok(Upload::Rejected("No file uploaded"));
    };
    let Some(part) = parts.into_iter().find(|p| p.name == "file") else {
        return Ok(Upload::Rejected("No file uploaded"));
    };
    let raw_name = part.filename.unwrap_or_default();
    if raw_name.trim().is_empty() {
        return Ok(Upload::Rejected("No file selected"));
    }
    let Some(name) = http::sanitize_filename(&raw_name) else {
        return Ok(Upload::Rejected("Invalid file name"));
    };
    let path = ctx.cfg.upload_dir.join(&name);
    fs::write(&path, &part.data).with_context(|| format!("save upload {}", path.display()))?;
    debug!(path = %path.display(), bytes = part.data.len(), "upload saved");
    Ok(Upload::Saved {
        name,
        data: part.data,
    })
}

fn handle_upload(stream: &mut TcpStream, req: &Request, ctx: &AppContext) -> Result<()> {
    let (name, data) = match store_upload(req, ctx)? {
        Upload::Saved { name, data } => (name, data),
        Upload::Rejected(msg) => return write_error(stream, 400, msg),
    };
    let frame = match Frame::decode(&data) {
        Ok(f) => f,
        Err(e) => {
            warn!(file = %name, "rejecting upload: {e}");
            return write_error(stream, 400, "Invalid image file");
        }
    };

    let start = Instant::now();
    let detections = match detect_shared(&ctx.detector, &frame) {
        Ok(d) => d,
        Err(e) => {
            error!(file = %name, "detection failed: {e}");
            return write_error(stream, error_status(&e), &format!("detection failed: {e}"));
        }
    };
    let report = FrameReport::new(detections, start.elapsed());
    info!(
        file = %name,
        detections = report.detections.len(),
        elapsed = %report.processing_time(),
        "image analysed"
    );

    let annotated = ctx.annotator.annotate(&frame, &report.detections);
    let mut detected = annotated_name(&name);
    if let Err(e) = annotated.save(&ctx.cfg.upload_dir.join(&detected)) {
        warn!(file = %detected, "cannot write annotated image in its own format: {e}");
        let _ = fs::remove_file(ctx.cfg.upload_dir.join(&detected));
        detected = format!("detected_{name}.jpg");
        annotated
            .save(&ctx.cfg.upload_dir.join(&detected))
            .with_context(|| format!("save {detected}"))?;
    }

    write_json(
        stream,
        200,
        &json!({
            "original_image": upload_url(&name),
            "detected_image": upload_url(&detected),
            "processing_time": report.processing_time(),
            "predictions": report.predictions(),
            "label_counts": report.tally,
        }),
    )
}

/// Runs every frame of an uploaded video through the detector. Predictions
/// and counts accumulate across the whole file.
fn handle_video(stream: &mut TcpStream, req: &Request, ctx: &AppContext) -> Result<()> {
    let name = match store_upload(req, ctx)? {
        Upload::Saved { name, .. } => name,
        Upload::Rejected(msg) => return write_error(stream, 400, msg),
    };
    let path = ctx.cfg.upload_dir.join(&name);
    let source = match source::open_video(&path) {
        Ok(s) => s,
        Err(e) => {
            warn!(file = %name, "rejecting video: {e}");
            return write_error(stream, error_status(&e), &format!("Invalid video file: {e}"));
        }
    };

    let start = Instant::now();
    let mut session = CaptureSession::new();
    session.open(source);
    let mut tally = LabelTally::new();
    let mut predictions: Vec<Prediction> = Vec::new();
    let mut frames = 0usize;
    let mut skipped = 0usize;
    loop {
        let frame = match session.next_frame() {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(e) if frames == 0 => {
                warn!(file = %name, "rejecting video: {e}");
                return write_error(stream, error_status(&e), &format!("Invalid video file: {e}"));
            }
            Err(e) => {
                warn!(file = %name, frames, "video read stopped early: {e}");
                break;
            }
        };
        frames += 1;
        match detect_shared(&ctx.detector, &frame) {
            Ok(dets) => {
                tally.record(&dets);
                predictions.extend(dets.iter().map(Prediction::from));
            }
            Err(e) => {
                skipped += 1;
                warn!(frame = frames, "detection failed, frame skipped: {e}");
            }
        }
    }
    session.stop();
    info!(
        file = %name,
        frames,
        skipped,
        detections = predictions.len(),
        elapsed = ?start.elapsed(),
        "video analysed"
    );

    write_json(
        stream,
        200,
        &json!({
            "video_path": upload_url(&name),
            "frames_processed": frames,
            "frames_skipped": skipped,
            "processing_time": format_seconds(start.elapsed()),
            "predictions": predictions,
            "label_counts": tally,
        }),
    )
}

/// Streams annotated camera frames as MJPEG until the camera is stopped,
/// preempted by another feed, exhausted, or the client goes away.
fn stream_camera(stream: &mut TcpStream, ctx: &AppContext) -> Result<()> {
    let lease = ctx.camera.acquire();
    if !lease.is_current() {
        return write_error(stream, 503, "Camera taken by a newer stream");
    }
    let mut session = CaptureSession::new();
    if let Err(e) = session.open_with(|| (ctx.open_camera)()) {
        warn!("camera unavailable: {e}");
        return write_error(stream, error_status(&e), &format!("Camera unavailable: {e}"));
    }
    http::start_mjpeg(stream)?;

    let mut sent = 0u64;
    while lease.is_current() && !ctx.shutdown.load(Ordering::SeqCst) {
        let frame = match session.next_frame() {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(e) => {
                warn!("camera read failed: {e}");
                break;
            }
        };
        let dets = match detect_shared(&ctx.detector, &frame) {
            Ok(d) => d,
            Err(e) => {
                warn!("detection failed, frame skipped: {e}");
                continue;
            }
        };
        let jpeg = match ctx.annotator.annotate(&frame, &dets).to_jpeg() {
            Ok(j) => j,
            Err(e) => {
                warn!("jpeg encoding failed, frame skipped: {e}");
                continue;
            }
        };
        if let Err(e) = http::write_mjpeg_part(stream, &jpeg) {
            debug!("feed client disconnected: {e}");
            break;
        }
        sent += 1;
    }
    session.stop();
    drop(lease);
    info!(frames = sent, "camera feed ended");
    Ok(())
}

fn serve_upload(stream: &mut TcpStream, raw: &str, ctx: &AppContext) -> Result<()> {
    let Ok(decoded) = percent_decode_str(raw).decode_utf8() else {
        return write_error(stream, 404, "not found");
    };
    let Some(name) = http::sanitize_filename(&decoded).filter(|n| *n == decoded) else {
        return write_error(stream, 404, "not found");
    };
    match fs::read(ctx.cfg.upload_dir.join(&name)) {
        Ok(data) => write_response(stream, 200, http::content_type_for(&name), &data),
        Err(_) => write_error(stream, 404, "not found"),
    }
}

/// Client-facing URL of a file stored in the upload directory.
pub fn upload_url(name: &str) -> String {
    format!("/uploads/{}", utf8_percent_encode(name, FILE_NAME))
}

/// Media the client sent is its own fault; everything else is ours.
fn error_status(e: &RelayError) -> u16 {
    if e.is_bad_input() {
        400
    } else {
        500
    }
}

/// Name of the annotated copy of `name`, keeping the original format when
/// the image crate can write it and falling back to JPEG otherwise.
pub fn annotated_name(name: &str) -> String {
    match ImageFormat::from_path(Path::new(name)) {
        Ok(fmt) if fmt.writing_enabled() => format!("detected_{name}"),
        _ => format!("detected_{name}.jpg"),
    }
}
