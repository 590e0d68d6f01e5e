use crate::detect::Detection;
use crate::error::{Error, Result};
use crate::frame::Frame;
use ab_glyph::{FontArc, PxScale};
use image::Rgb;
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::Path;
use tracing::warn;

const PALETTE: [[u8; 3]; 12] = [
    [255, 0, 0],
    [0, 255, 0],
    [0, 0, 255],
    [255, 255, 0],
    [255, 0, 255],
    [0, 255, 255],
    [255, 128, 0],
    [255, 0, 128],
    [128, 255, 0],
    [0, 128, 255],
    [255, 255, 255],
    [128, 0, 255],
];

/// Draws detection boxes and, when a font is loaded, their captions.
#[derive(Clone)]
pub struct Annotator {
    font: Option<FontArc>,
    text_scale: f32,
}

impl Default for Annotator {
    fn default() -> Self {
        Self::new()
    }
}

impl Annotator {
    pub fn new() -> Self {
        Self {
            font: None,
            text_scale: 14.0,
        }
    }

    pub fn with_font(mut self, font: FontArc) -> Self {
        self.font = Some(font);
        self
    }

    /// Loads the caption font from `path`. A missing or unreadable font
    /// leaves the annotator drawing boxes only.
    pub fn with_font_file(self, path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return self;
        };
        match load_font(path) {
            Ok(font) => self.with_font(font),
            Err(e) => {
                warn!(path = %path.display(), "caption font unavailable: {e}");
                self
            }
        }
    }

    /// Returns a copy of `frame` with every detection drawn on it.
    pub fn annotate(&self, frame: &Frame, dets: &[Detection]) -> Frame {
        let mut img = frame.as_rgb().clone();
        let (w, h) = (img.width() as f32, img.height() as f32);
        for det in dets {
            let color = Rgb(PALETTE[det.class_id % PALETTE.len()]);
            let b = det.bbox.clamp(w, h);
            let (bw, bh) = (b.width() as u32, b.height() as u32);
            if bw > 0 && bh > 0 {
                let rect = Rect::at(b.x1 as i32, b.y1 as i32).of_size(bw, bh);
                draw_hollow_rect_mut(&mut img, rect, color);
            }
            if let Some(font) = &self.font {
                let caption = format!("{} {:.2}", det.label, det.confidence);
                let scale = PxScale::from(self.text_scale);
                let (tw, th) = text_size(scale, font, &caption);
                let ty = (b.y1 as i32 - th as i32 - 2).max(0);
                if tw > 0 && th > 0 {
                    draw_filled_rect_mut(
                        &mut img,
                        Rect::at(b.x1 as i32, ty).of_size(tw + 2, th + 2),
                        color,
                    );
                }
                draw_text_mut(
                    &mut img,
                    Rgb([0, 0, 0]),
                    b.x1 as i32 + 1,
                    ty + 1,
                    scale,
                    font,
                    &caption,
                );
            }
        }
        Frame::new(img)
    }
}

fn load_font(path: &Path) -> Result<FontArc> {
    let data = std::fs::read(path)?;
    FontArc::try_from_vec(data).map_err(|e| Error::Unsupported(format!("font: {e}")))
}
