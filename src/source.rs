//! Frame sources: camera devices, video files and still images.

use crate::error::{Error, Result};
use crate::frame::Frame;
use image::codecs::gif::GifDecoder;
use image::{AnimationDecoder, DynamicImage, Frames};
use nokhwa::{
    pixel_format::RgbFormat,
    utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType},
    Camera,
};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Something that yields frames until it runs dry.
pub trait FrameSource {
    /// Human readable description used in logs.
    fn describe(&self) -> String;

    /// Next frame, or `None` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Releases the underlying device or file handle. Called once by the
    /// owning session; dropping the source must release it too.
    fn release(&mut self) {}
}

/// A live camera opened through nokhwa.
pub struct CameraSource {
    index: u32,
    camera: Option<Camera>,
}

impl CameraSource {
    pub fn open(index: u32) -> Result<Self> {
        let mut camera = None;
        for (w, h) in [(1280, 720), (640, 480)] {
            for fmt in [FrameFormat::RAWRGB, FrameFormat::MJPEG, FrameFormat::YUYV] {
                let req = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
                    CameraFormat::new_from(w, h, fmt, 30),
                ));
                if let Ok(c) = Camera::new(CameraIndex::Index(index), req) {
                    camera = Some(c);
                    break;
                }
            }
            if camera.is_some() {
                break;
            }
        }
        let fallback = RequestedFormat::new::<RgbFormat>(RequestedFormatType::None);
        let mut camera = match camera {
            Some(c) => c,
            None => Camera::new(CameraIndex::Index(index), fallback)
                .map_err(|e| Error::source_unavailable(format!("camera {index}"), e))?,
        };
        camera
            .open_stream()
            .map_err(|e| Error::source_unavailable(format!("camera {index} stream"), e))?;
        debug!(index, format = ?camera.camera_format(), "camera stream opened");
        Ok(Self {
            index,
            camera: Some(camera),
        })
    }
}

impl FrameSource for CameraSource {
    fn describe(&self) -> String {
        format!("camera {}", self.index)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(camera) = self.camera.as_mut() else {
            return Ok(None);
        };
        let buffer = camera
            .frame()
            .map_err(|e| Error::Capture(e.to_string()))?;
        let img = buffer
            .decode_image::<RgbFormat>()
            .map_err(|e| Error::Capture(e.to_string()))?;
        Ok(Some(DynamicImage::ImageRgb8(img).into()))
    }

    fn release(&mut self) {
        if let Some(mut camera) = self.camera.take() {
            if let Err(e) = camera.stop_stream() {
                debug!(index = self.index, "camera stream stop failed: {e}");
            }
            info!(index = self.index, "camera released");
        }
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.release();
    }
}

/// A single picture, yielded once.
pub struct StillImage {
    path: PathBuf,
    frame: Option<Frame>,
}

impl StillImage {
    pub fn open(path: &Path) -> Result<Self> {
        let frame = Frame::open(path)
            .map_err(|e| Error::source_unavailable(path.display().to_string(), e))?;
        Ok(Self {
            path: path.to_path_buf(),
            frame: Some(frame),
        })
    }
}

impl FrameSource for StillImage {
    fn describe(&self) -> String {
        format!("image {}", self.path.display())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        Ok(self.frame.take())
    }

    fn release(&mut self) {
        self.frame = None;
    }
}

/// Animated GIF decoded frame by frame with the `image` crate.
pub struct GifSource {
    path: PathBuf,
    frames: Option<Frames<'static>>,
}

impl GifSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::source_unavailable(path.display().to_string(), e))?;
        let decoder = GifDecoder::new(BufReader::new(file))
            .map_err(|e| Error::source_unavailable(path.display().to_string(), e))?;
        Ok(Self {
            path: path.to_path_buf(),
            frames: Some(decoder.into_frames()),
        })
    }
}

impl FrameSource for GifSource {
    fn describe(&self) -> String {
        format!("video {}", self.path.display())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(frames) = self.frames.as_mut() else {
            return Ok(None);
        };
        match frames.next() {
            Some(frame) => {
                let rgba = frame?.into_buffer();
                Ok(Some(DynamicImage::ImageRgba8(rgba).into()))
            }
            None => {
                self.frames = None;
                Ok(None)
            }
        }
    }

    fn release(&mut self) {
        self.frames = None;
    }
}

/// Opens a video file, picking the decoder from the file extension.
pub fn open_video(path: &Path) -> Result<Box<dyn FrameSource>> {
    if !path.is_file() {
        return Err(Error::source_unavailable(
            path.display().to_string(),
            "no such file",
        ));
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if ext == "gif" {
        return Ok(Box::new(GifSource::open(path)?));
    }
    open_container(path)
}

#[cfg(feature = "video-ffmpeg")]
fn open_container(path: &Path) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(crate::ffmpeg::FfmpegSource::open(path)?))
}

#[cfg(not(feature = "video-ffmpeg"))]
fn open_container(path: &Path) -> Result<Box<dyn FrameSource>> {
    Err(Error::Unsupported(format!(
        "{}: only GIF video is available without the video-ffmpeg feature",
        path.display()
    )))
}

pub fn open_camera(index: u32) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(CameraSource::open(index)?))
}

pub fn open_image(path: &Path) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(StillImage::open(path)?))
}
