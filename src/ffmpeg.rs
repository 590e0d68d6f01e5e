//! Video container decoding through FFmpeg (feature `video-ffmpeg`).

use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::source::FrameSource;
use ffmpeg_next as ffmpeg;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct FfmpegSource {
    path: PathBuf,
    input: Option<ffmpeg::format::context::Input>,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    eof_sent: bool,
    frame_count: u64,
}

impl FfmpegSource {
    pub fn open(path: &Path) -> Result<Self> {
        let unavailable = |e: ffmpeg::Error| Error::source_unavailable(path.display().to_string(), e);
        ffmpeg::init().map_err(unavailable)?;
        let input = ffmpeg::format::input(&path).map_err(unavailable)?;
        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| Error::source_unavailable(path.display().to_string(), "no video track"))?;
        let stream_index = stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(unavailable)?;
        let decoder = context.decoder().video().map_err(unavailable)?;
        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .map_err(unavailable)?;
        info!(path = %path.display(), width = decoder.width(), height = decoder.height(), "video opened");
        Ok(Self {
            path: path.to_path_buf(),
            input: Some(input),
            stream_index,
            decoder,
            scaler,
            eof_sent: false,
            frame_count: 0,
        })
    }

    fn receive(&mut self) -> Result<Option<Frame>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        if self.decoder.receive_frame(&mut decoded).is_err() {
            return Ok(None);
        }
        let mut rgb = ffmpeg::frame::Video::empty();
        self.scaler
            .run(&decoded, &mut rgb)
            .map_err(|e| Error::Capture(e.to_string()))?;
        self.frame_count += 1;
        frame_to_rgb(&rgb).map(Some)
    }
}

impl FrameSource for FfmpegSource {
    fn describe(&self) -> String {
        format!("video {}", self.path.display())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.receive()? {
                return Ok(Some(frame));
            }
            if self.eof_sent {
                debug!(frames = self.frame_count, "video exhausted");
                return Ok(None);
            }
            let index = self.stream_index;
            let Some(input) = self.input.as_mut() else {
                return Ok(None);
            };
            let packet = input
                .packets()
                .find(|(stream, _)| stream.index() == index)
                .map(|(_, packet)| packet);
            match packet {
                Some(packet) => self
                    .decoder
                    .send_packet(&packet)
                    .map_err(|e| Error::Capture(e.to_string()))?,
                None => {
                    self.decoder
                        .send_eof()
                        .map_err(|e| Error::Capture(e.to_string()))?;
                    self.eof_sent = true;
                }
            }
        }
    }

    fn release(&mut self) {
        self.input = None;
        self.eof_sent = true;
    }
}

fn frame_to_rgb(frame: &ffmpeg::frame::Video) -> Result<Frame> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = width as usize * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let line = data
            .get(start..start + row_bytes)
            .ok_or_else(|| Error::Capture("ffmpeg frame row is out of bounds".to_string()))?;
        pixels.extend_from_slice(line);
    }
    Frame::from_raw(width, height, pixels)
        .ok_or_else(|| Error::Capture("ffmpeg frame has wrong size".to_string()))
}
