use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::util::ffmpeg_discovery::FfmpegPaths;

/// Default minimum interval between two printed percentage updates
pub const DEFAULT_THROTTLE_MS: u64 = 100;

#[derive(Debug, Clone)]
pub struct Config {
    pub ffmpeg_path: PathBuf,
    /// Minimum interval between progress updates shown to the user
    pub throttle: Duration,
}

impl Config {
    /// Build the config from the environment.
    ///
    /// Fails when no ffmpeg binary can be found; nothing can run without one.
    pub fn from_env() -> Result<Self, ConfigError> {
        let ffmpeg_path = FfmpegPaths::global()?.ffmpeg.clone();
        let throttle = parse_throttle(std::env::var("PROGRESS_THROTTLE_MS").ok().as_deref())?;

        Ok(Self {
            ffmpeg_path,
            throttle,
        })
    }

    pub fn with_throttle_ms(mut self, ms: u64) -> Self {
        self.throttle = Duration::from_millis(ms);
        self
    }
}

fn parse_throttle(value: Option<&str>) -> Result<Duration, ConfigError> {
    match value.map(str::trim) {
        None | Some("") => Ok(Duration::from_millis(DEFAULT_THROTTLE_MS)),
        Some(raw) => raw
            .parse()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::InvalidValue("PROGRESS_THROTTLE_MS")),
    }
}

/// Directory holding the optional `env` file.
pub fn default_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FFMPEG_PROGRESS_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ffmpeg-progress")
}

/// Load `.env` from the working directory, then `<config dir>/env`.
///
/// Variables already set in the environment are never overridden.
pub fn load_env_files() {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: Error loading .env file: {}", e);
        }
    }

    let env_path = default_config_dir().join("env");
    if env_path.exists() {
        if let Err(e) = dotenvy::from_path(&env_path) {
            eprintln!("Warning: Error loading env file from {:?}: {}", env_path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_default() {
        assert_eq!(parse_throttle(None), Ok(Duration::from_millis(100)));
        assert_eq!(parse_throttle(Some("  ")), Ok(Duration::from_millis(100)));
    }

    #[test]
    fn test_throttle_parse() {
        assert_eq!(parse_throttle(Some("250")), Ok(Duration::from_millis(250)));
        assert_eq!(parse_throttle(Some("0")), Ok(Duration::ZERO));
        assert_eq!(
            parse_throttle(Some("fast")),
            Err(ConfigError::InvalidValue("PROGRESS_THROTTLE_MS"))
        );
    }

    #[test]
    fn test_with_throttle_override() {
        let config = Config {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            throttle: Duration::from_millis(DEFAULT_THROTTLE_MS),
        }
        .with_throttle_ms(40);
        assert_eq!(config.throttle, Duration::from_millis(40));
    }

    #[test]
    fn test_config_dir_name() {
        if std::env::var_os("FFMPEG_PROGRESS_CONFIG_DIR").is_none() {
            assert!(default_config_dir().ends_with("ffmpeg-progress"));
        }
    }
}
