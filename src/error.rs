use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("FFmpeg not found. Searched: {0}")]
    FfmpegNotFound(String),

    #[error("Invalid value for {0}")]
    InvalidValue(&'static str),
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to spawn ffmpeg: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("FFmpeg failed: {0}")]
    Engine(#[from] EngineFailure),

    #[error("ffmpeg never got as far as reading the duration")]
    DurationUnavailable,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stream task failed: {0}")]
    Join(String),
}

/// A finished ffmpeg run that exited with a non-zero status.
///
/// Displays as the captured stderr text, which is where ffmpeg explains
/// what went wrong.
#[derive(Clone, PartialEq, Eq)]
pub struct EngineFailure {
    pub exit_status: i32,
    pub diagnostics: Vec<u8>,
}

impl EngineFailure {
    pub fn new(exit_status: i32, diagnostics: Vec<u8>) -> Self {
        Self {
            exit_status,
            diagnostics,
        }
    }

    /// Diagnostics decoded as lossy UTF-8.
    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.diagnostics).into_owned()
    }
}

impl fmt::Display for EngineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.diagnostics))
    }
}

impl std::error::Error for EngineFailure {}

impl fmt::Debug for EngineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineFailure")
            .field("exit_status", &self.exit_status)
            .field("diagnostics", &String::from_utf8_lossy(&self.diagnostics))
            .finish()
    }
}
