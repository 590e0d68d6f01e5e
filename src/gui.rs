//! Desktop front-end: original and annotated panels, a log, and controls
//! for video files, the camera, still images and stopping.

use crate::annotate::Annotator;
use crate::config::Config;
use crate::detect::{detect_shared, SharedDetector};
use crate::frame::Frame;
use crate::relay::{Relay, RelayOutput};
use crate::report::FrameReport;
use crate::session::CaptureSession;
use crate::source;
use crossbeam_channel::Receiver;
use egui_macroquad::egui;
use macroquad::prelude::*;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const WINDOW_WIDTH: i32 = 1200;
const WINDOW_HEIGHT: i32 = 800;
const PANEL_TOP: f32 = 20.0;
const PANEL_MARGIN: f32 = 20.0;
const CONTROLS_HEIGHT: f32 = 320.0;
const LOG_LIMIT: usize = 1000;
const MAX_PANEL_SIDE: u32 = 4096;
const RELAY_IDLE: Duration = Duration::from_millis(10);

enum Action {
    OpenVideo,
    StartCamera,
    Stop,
    OpenImage,
}

struct DetectorApp {
    session: CaptureSession,
    relay: Relay,
    results: Receiver<RelayOutput>,
    detector: SharedDetector,
    annotator: Annotator,
    original: Option<Texture2D>,
    annotated: Option<Texture2D>,
    log: Vec<String>,
    video_path: String,
    image_path: String,
    camera_index: u32,
    panel_size: (u32, u32),
    interval: Duration,
    last_tick: Instant,
}

/// Opens the window and runs the UI loop on the calling thread until the
/// window closes.
pub fn run(cfg: Config, detector: SharedDetector, annotator: Annotator) {
    let conf = Conf {
        window_title: "Object detection".to_string(),
        window_width: WINDOW_WIDTH,
        window_height: WINDOW_HEIGHT,
        window_resizable: true,
        ..Default::default()
    };
    macroquad::Window::from_config(conf, async move {
        let mut app = DetectorApp::new(&cfg, detector, annotator);
        loop {
            app.update();
            app.draw();
            app.draw_egui();
            next_frame().await;
        }
    });
}

impl DetectorApp {
    fn new(cfg: &Config, detector: SharedDetector, annotator: Annotator) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(4);
        let relay = Relay::spawn(detector.clone(), annotator.clone(), tx, RELAY_IDLE);
        info!("detector window started");
        Self {
            session: CaptureSession::new(),
            relay,
            results: rx,
            detector,
            annotator,
            original: None,
            annotated: None,
            log: Vec::new(),
            video_path: String::new(),
            image_path: String::new(),
            camera_index: cfg.camera_index,
            panel_size: (
                cfg.panel_width.clamp(1, MAX_PANEL_SIDE),
                cfg.panel_height.clamp(1, MAX_PANEL_SIDE),
            ),
            interval: Duration::from_millis(cfg.display_interval_ms.max(1)),
            last_tick: Instant::now(),
        }
    }

    fn push_log(&mut self, text: impl Into<String>) {
        self.log.push(text.into());
        if self.log.len() > LOG_LIMIT {
            let excess = self.log.len() - LOG_LIMIT;
            self.log.drain(..excess);
        }
    }

    fn update(&mut self) {
        // Relay results arrive here and only here, on the UI thread.
        let outputs: Vec<RelayOutput> = self.results.try_iter().collect();
        if let Some(last) = outputs.last() {
            self.annotated = Some(texture_from(&last.annotated));
        }
        for out in outputs {
            self.push_log(out.report.log_text());
        }

        if !self.session.is_active() || self.last_tick.elapsed() < self.interval {
            return;
        }
        self.last_tick = Instant::now();
        match self.session.next_frame() {
            Ok(Some(frame)) => {
                let (w, h) = self.panel_size;
                let frame = frame.resized(w, h);
                self.original = Some(texture_from(&frame));
                self.relay.submit(frame);
            }
            Ok(None) => self.push_log("Source finished"),
            Err(e) => {
                warn!("failed to read frame: {e}");
                self.push_log(format!("Failed to read frame: {e}"));
            }
        }
    }

    fn start_camera(&mut self) {
        let index = self.camera_index;
        match self.session.open_with(|| source::open_camera(index)) {
            Ok(()) => {
                self.last_tick = Instant::now() - self.interval;
                self.push_log(format!("Camera {} opened", self.camera_index));
            }
            Err(e) => {
                warn!("camera unavailable: {e}");
                self.push_log(format!("Cannot open camera: {e}"));
            }
        }
    }

    fn open_video(&mut self) {
        let path = self.video_path.trim().to_string();
        if path.is_empty() {
            self.push_log("Enter a video file path first");
            return;
        }
        match self.session.open_with(|| source::open_video(Path::new(&path))) {
            Ok(()) => {
                self.last_tick = Instant::now() - self.interval;
                self.push_log(format!("Video opened: {path}"));
            }
            Err(e) => {
                warn!(path, "video unavailable: {e}");
                self.push_log(format!("Cannot open video file: {e}"));
            }
        }
    }

    fn open_image(&mut self) {
        let path = self.image_path.trim().to_string();
        if path.is_empty() {
            self.push_log("Enter an image file path first");
            return;
        }
        let frame = match Frame::open(Path::new(&path)) {
            Ok(f) => f,
            Err(e) => {
                warn!(path, "image unreadable: {e}");
                self.push_log(format!("Cannot read image file: {e}"));
                return;
            }
        };
        let start = Instant::now();
        match detect_shared(&self.detector, &frame) {
            Ok(dets) => {
                let report = FrameReport::new(dets, start.elapsed());
                let annotated = self.annotator.annotate(&frame, &report.detections);
                let (w, h) = self.panel_size;
                self.original = Some(texture_from(&frame.fit_within(w, h)));
                self.annotated = Some(texture_from(&annotated.fit_within(w, h)));
                self.push_log(report.log_text());
            }
            Err(e) => {
                warn!(path, "detection failed: {e}");
                self.push_log(format!("Detection failed: {e}"));
            }
        }
    }

    fn stop(&mut self) {
        self.session.stop();
        self.original = None;
        self.annotated = None;
        self.push_log("Stopped");
    }

    fn draw(&self) {
        clear_background(Color::from_rgba(246, 248, 252, 255));
        let panel_w = (screen_width() - 3.0 * PANEL_MARGIN) / 2.0;
        let panel_h = (screen_height() - CONTROLS_HEIGHT - PANEL_TOP - PANEL_MARGIN).max(1.0);
        let panels = [
            (PANEL_MARGIN, &self.original),
            (2.0 * PANEL_MARGIN + panel_w, &self.annotated),
        ];
        for (x, texture) in panels {
            draw_rectangle_lines(
                x,
                PANEL_TOP,
                panel_w,
                panel_h,
                1.0,
                Color::from_rgba(215, 226, 249, 255),
            );
            if let Some(texture) = texture {
                let scale = (panel_w / texture.width()).min(panel_h / texture.height());
                let (w, h) = (texture.width() * scale, texture.height() * scale);
                draw_texture_ex(
                    texture,
                    x + (panel_w - w) / 2.0,
                    PANEL_TOP + (panel_h - h) / 2.0,
                    WHITE,
                    DrawTextureParams {
                        dest_size: Some(vec2(w, h)),
                        ..Default::default()
                    },
                );
            }
        }
    }

    fn draw_egui(&mut self) {
        let mut actions = Vec::new();
        egui_macroquad::ui(|egui_ctx| {
            egui::TopBottomPanel::bottom("controls")
                .exact_height(CONTROLS_HEIGHT - PANEL_MARGIN)
                .show(egui_ctx, |ui| {
                    ui.horizontal_top(|ui| {
                        ui.vertical(|ui| {
                            ui.set_width((ui.available_width() - 280.0).max(200.0));
                            egui::ScrollArea::vertical()
                                .stick_to_bottom(true)
                                .auto_shrink([false, false])
                                .show(ui, |ui| {
                                    for entry in &self.log {
                                        ui.monospace(entry);
                                    }
                                });
                        });
                        ui.separator();
                        ui.vertical(|ui| {
                            ui.label("Video file:");
                            ui.text_edit_singleline(&mut self.video_path);
                            if ui.button("🎞 Video file").clicked() {
                                actions.push(Action::OpenVideo);
                            }
                            if ui.button("📹 Camera").clicked() {
                                actions.push(Action::StartCamera);
                            }
                            if ui.button("🛑 Stop").clicked() {
                                actions.push(Action::Stop);
                            }
                            ui.separator();
                            ui.label("Image file:");
                            ui.text_edit_singleline(&mut self.image_path);
                            if ui.button("🖼 Image file").clicked() {
                                actions.push(Action::OpenImage);
                            }
                            ui.separator();
                            let stats = self.relay.stats();
                            ui.label(format!("Source: {:?}", self.session.state()));
                            ui.label(format!(
                                "Analysed {} | dropped {} | failed {}",
                                stats.processed, stats.dropped, stats.failed
                            ));
                        });
                    });
                });
        });
        egui_macroquad::draw();

        for action in actions {
            match action {
                Action::OpenVideo => self.open_video(),
                Action::StartCamera => self.start_camera(),
                Action::Stop => self.stop(),
                Action::OpenImage => self.open_image(),
            }
        }
    }
}

/// Callers hand in frames already scaled to a panel, so both sides fit
/// the `u16` texture dimensions.
fn texture_from(frame: &Frame) -> Texture2D {
    let texture = Texture2D::from_rgba8(
        frame.width() as u16,
        frame.height() as u16,
        &frame.to_rgba(),
    );
    texture.set_filter(FilterMode::Linear);
    texture
}
