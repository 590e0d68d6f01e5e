use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open {what}: {reason}")]
    SourceUnavailable { what: String, reason: String },
    #[error("unsupported media: {0}")]
    Unsupported(String),
    #[error("failed to decode image: {0}")]
    Image(#[from] image::ImageError),
    #[error("failed to read frame: {0}")]
    Capture(String),
    #[error("model error: {0}")]
    Model(String),
    #[error("detector failed: {0}")]
    Detector(String),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn source_unavailable(what: impl Into<String>, reason: impl ToString) -> Self {
        Self::SourceUnavailable {
            what: what.into(),
            reason: reason.to_string(),
        }
    }

    /// True when the error stems from the media handed in by the caller
    /// rather than from the runtime environment.
    pub fn is_bad_input(&self) -> bool {
        matches!(
            self,
            Error::SourceUnavailable { .. } | Error::Unsupported(_) | Error::Image(_)
        )
    }
}
