//! FFmpeg progress supervisor
//!
//! Runs ffmpeg with `-progress -`, follows its progress and log output, and
//! reports completion ratios and raw progress blocks to caller callbacks.

pub mod config;
pub mod error;
pub mod util;
pub mod video;

pub use config::Config;
pub use error::{ConfigError, EngineFailure, SupervisorError};
pub use util::ffmpeg_progress::ProgressUpdate;
pub use video::{RunHandle, RunOutcome, RunState, Supervisor};
