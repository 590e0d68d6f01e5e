use crate::error::Result;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, RgbImage};
use std::io::Cursor;
use std::path::Path;

/// An owned RGB8 picture travelling between pipeline stages.
///
/// Stages hand frames to each other by value (or by `clone`), so no two
/// stages ever observe the same buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    image: RgbImage,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self { image }
    }

    pub fn from_raw(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        RgbImage::from_raw(width, height, pixels).map(Self::new)
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(image::open(path)?.into())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(image::load_from_memory(bytes)?.into())
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn as_rgb(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_rgb(self) -> RgbImage {
        self.image
    }

    pub fn resized(&self, width: u32, height: u32) -> Frame {
        if self.width() == width && self.height() == height {
            return self.clone();
        }
        Frame::new(image::imageops::resize(
            &self.image,
            width,
            height,
            FilterType::Triangle,
        ))
    }

    /// Scales the frame down, keeping its aspect ratio, until it fits in
    /// `max_width` x `max_height`. Frames that already fit are returned as is.
    pub fn fit_within(&self, max_width: u32, max_height: u32) -> Frame {
        let (w, h) = (self.width(), self.height());
        if w <= max_width && h <= max_height {
            return self.clone();
        }
        let scale = (max_width as f64 / w as f64).min(max_height as f64 / h as f64);
        let fit = |side: u32| ((side as f64 * scale).round() as u32).max(1);
        self.resized(fit(w), fit(h))
    }

    pub fn to_rgba(&self) -> Vec<u8> {
        DynamicImage::ImageRgb8(self.image.clone())
            .into_rgba8()
            .into_raw()
    }

    pub fn to_jpeg(&self) -> Result<Vec<u8>> {
        let mut buf = Cursor::new(Vec::new());
        self.image.write_to(&mut buf, ImageFormat::Jpeg)?;
        Ok(buf.into_inner())
    }

    /// Writes the frame using the format implied by the extension of `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.image.save(path)?;
        Ok(())
    }
}

impl From<DynamicImage> for Frame {
    fn from(img: DynamicImage) -> Self {
        Self::new(img.into_rgb8())
    }
}

impl From<RgbImage> for Frame {
    fn from(img: RgbImage) -> Self {
        Self::new(img)
    }
}
