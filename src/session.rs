use crate::error::Result;
use crate::frame::Frame;
use crate::source::FrameSource;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Opened,
    Streaming,
}

/// Owns at most one frame source at a time.
///
/// `Idle -> Opened` on [`open`](Self::open), `Opened -> Streaming` on the
/// first frame, and back to `Idle` on [`stop`](Self::stop) or when the
/// source runs dry.
pub struct CaptureSession {
    source: Option<Box<dyn FrameSource>>,
    state: SessionState,
}

impl Default for CaptureSession {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSession {
    pub fn new() -> Self {
        Self {
            source: None,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state != SessionState::Idle
    }

    pub fn describe(&self) -> Option<String> {
        self.source.as_ref().map(|s| s.describe())
    }

    /// Replaces the current source with one that is already open.
    pub fn open(&mut self, source: Box<dyn FrameSource>) {
        self.stop();
        self.install(source);
    }

    /// Releases the current source, then runs `opener` for the next one.
    /// Exclusive devices are free again by the time `opener` runs; on
    /// failure the session stays `Idle`.
    pub fn open_with<F>(&mut self, opener: F) -> Result<()>
    where
        F: FnOnce() -> Result<Box<dyn FrameSource>>,
    {
        self.stop();
        self.install(opener()?);
        Ok(())
    }

    fn install(&mut self, source: Box<dyn FrameSource>) {
        info!(source = %source.describe(), "source opened");
        self.source = Some(source);
        self.state = SessionState::Opened;
    }

    /// Pulls the next frame. Exhaustion releases the source and returns the
    /// session to `Idle`; read errors leave the source in place.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(source) = self.source.as_mut() else {
            return Ok(None);
        };
        match source.next_frame()? {
            Some(frame) => {
                self.state = SessionState::Streaming;
                Ok(Some(frame))
            }
            None => {
                debug!(source = %source.describe(), "source exhausted");
                self.stop();
                Ok(None)
            }
        }
    }

    /// Releases the current source. Returns `false` when there was nothing
    /// to release.
    pub fn stop(&mut self) -> bool {
        self.state = SessionState::Idle;
        match self.source.take() {
            Some(mut source) => {
                source.release();
                info!(source = %source.describe(), "source released");
                true
            }
            None => false,
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}
