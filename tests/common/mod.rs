#![allow(dead_code)]

use detect_relay::detect::{BoundingBox, Detection, Detector};
use detect_relay::error::{Error, Result};
use detect_relay::source::FrameSource;
use detect_relay::Frame;
use image::{Rgb, RgbImage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn det(label: &str, class_id: usize, confidence: f32) -> Detection {
    Detection {
        label: label.to_string(),
        class_id,
        confidence,
        bbox: BoundingBox {
            x1: 2.0,
            y1: 2.0,
            x2: 20.0,
            y2: 20.0,
        },
    }
}

pub fn frame(width: u32, height: u32) -> Frame {
    Frame::new(RgbImage::from_pixel(width, height, Rgb([120, 130, 140])))
}

/// Pseudo-random pixels, so JPEG parts stay large.
pub fn noise_frame(width: u32, height: u32, seed: u32) -> Frame {
    let mut x = seed | 1;
    Frame::new(RgbImage::from_fn(width, height, |_, _| {
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        let [r, g, b, _] = x.to_le_bytes();
        Rgb([r, g, b])
    }))
}

/// Returns the same detections for every frame.
pub struct FixedDetector {
    pub dets: Vec<Detection>,
    pub calls: Arc<AtomicUsize>,
}

impl FixedDetector {
    pub fn new(dets: Vec<Detection>) -> Self {
        Self {
            dets,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Detector for FixedDetector {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.dets.clone())
    }
}

/// Fails on every call.
pub struct FailingDetector;

impl Detector for FailingDetector {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        Err(Error::Detector("model exploded".to_string()))
    }
}

/// Fails on every other call, starting with the first.
pub struct AlternatingDetector {
    pub dets: Vec<Detection>,
    pub calls: Arc<AtomicUsize>,
}

impl AlternatingDetector {
    pub fn new(dets: Vec<Detection>) -> Self {
        Self {
            dets,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Detector for AlternatingDetector {
    fn name(&self) -> &'static str {
        "alternating"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            return Err(Error::Detector("intermittent failure".to_string()));
        }
        Ok(self.dets.clone())
    }
}

/// Blocks for `delay` on each frame, then reports nothing.
pub struct SlowDetector {
    pub delay: Duration,
}

impl Detector for SlowDetector {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        std::thread::sleep(self.delay);
        Ok(Vec::new())
    }
}

/// Frame source that counts how many instances hold an open handle.
pub struct TrackedSource {
    live: Arc<AtomicUsize>,
    open: bool,
    remaining: Option<usize>,
    delay: Duration,
    size: (u32, u32),
    noisy: bool,
    served: u32,
}

impl TrackedSource {
    pub fn new(live: Arc<AtomicUsize>, frames: Option<usize>, delay: Duration) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self {
            live,
            open: true,
            remaining: frames,
            delay,
            size: (32, 24),
            noisy: false,
            served: 0,
        }
    }

    /// Yields `width`x`height` noise instead of flat grey frames.
    pub fn noisy(mut self, width: u32, height: u32) -> Self {
        self.size = (width, height);
        self.noisy = true;
        self
    }
}

impl FrameSource for TrackedSource {
    fn describe(&self) -> String {
        "tracked".to_string()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if !self.open {
            return Ok(None);
        }
        if let Some(left) = self.remaining.as_mut() {
            if *left == 0 {
                return Ok(None);
            }
            *left -= 1;
        }
        std::thread::sleep(self.delay);
        self.served = self.served.wrapping_add(1);
        let (w, h) = self.size;
        if self.noisy {
            Ok(Some(noise_frame(w, h, self.served)))
        } else {
            Ok(Some(frame(w, h)))
        }
    }

    fn release(&mut self) {
        if self.open {
            self.open = false;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for TrackedSource {
    fn drop(&mut self) {
        self.release();
    }
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut out = std::io::Cursor::new(Vec::new());
    frame(width, height)
        .into_rgb()
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

pub fn gif_bytes(frames: usize) -> Vec<u8> {
    use image::codecs::gif::GifEncoder;
    let mut out = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut out);
        let frames = (0..frames).map(|i| {
            let shade = (i * 40) as u8;
            image::Frame::new(image::RgbaImage::from_pixel(
                16,
                16,
                image::Rgba([shade, 60, 90, 255]),
            ))
        });
        encoder.encode_frames(frames).unwrap();
    }
    out
}

pub const BOUNDARY: &str = "detectrelayboundary";

/// Builds a `multipart/form-data` body with a single file field.
pub fn multipart(field: &str, filename: &str, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub fn content_type() -> String {
    format!("multipart/form-data; boundary={BOUNDARY}")
}
