pub mod annotate;
pub mod cli;
pub mod config;
pub mod detect;
pub mod error;
#[cfg(feature = "video-ffmpeg")]
pub mod ffmpeg;
pub mod frame;
#[cfg(feature = "gui")]
pub mod gui;
pub mod relay;
pub mod report;
pub mod server;
pub mod session;
pub mod source;
pub mod tally;

pub use cli::{execute, run_cli, Cli, Commands, ConfigSubcommand};
pub use detect::{Detection, Detector, SharedDetector};
pub use error::{Error, Result};
pub use frame::Frame;
pub use relay::{FrameSlot, Relay, RelayOutput};
pub use session::{CaptureSession, SessionState};
pub use tally::LabelTally;
