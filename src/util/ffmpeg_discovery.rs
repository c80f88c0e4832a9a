use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

use crate::error::ConfigError;

static DISCOVERED: OnceLock<Result<FfmpegPaths, ConfigError>> = OnceLock::new();

/// Discovered FFmpeg binary path
#[derive(Debug, Clone)]
pub struct FfmpegPaths {
    pub ffmpeg: PathBuf,
}

impl FfmpegPaths {
    /// Look up the ffmpeg binary: `FFMPEG_PATH` first, then the usual
    /// install prefixes, then `$PATH`.
    pub fn discover() -> Result<Self, ConfigError> {
        let ffmpeg = Self::find_ffmpeg()?;

        info!(ffmpeg = %ffmpeg.display(), "FFmpeg binary discovered");

        Ok(Self { ffmpeg })
    }

    /// Process-wide discovery, performed once and cached.
    ///
    /// A failed lookup is cached as well: every later caller gets the same
    /// error without searching the filesystem again.
    pub fn global() -> Result<&'static Self, ConfigError> {
        DISCOVERED
            .get_or_init(Self::discover)
            .as_ref()
            .map_err(Clone::clone)
    }

    fn find_ffmpeg() -> Result<PathBuf, ConfigError> {
        if let Some(path) = std::env::var_os("FFMPEG_PATH").map(PathBuf::from) {
            if runs_as_ffmpeg(&path) {
                debug!(path = %path.display(), "Using FFMPEG_PATH");
                return Ok(path);
            }
            warn!(path = %path.display(), "FFMPEG_PATH is not a working ffmpeg, searching");
        }

        let candidates = install_locations();
        if let Some(path) = candidates.iter().find(|path| runs_as_ffmpeg(path)) {
            debug!(path = %path.display(), "FFmpeg found in install location");
            return Ok(path.clone());
        }

        if let Some(path) = search_path() {
            debug!(path = %path.display(), "FFmpeg found in PATH");
            return Ok(path);
        }

        let mut searched: Vec<String> = candidates.iter().map(|p| p.display().to_string()).collect();
        searched.push("$PATH".to_string());
        Err(ConfigError::FfmpegNotFound(searched.join(", ")))
    }
}

#[cfg(windows)]
const BINARY: &str = "ffmpeg.exe";
#[cfg(not(windows))]
const BINARY: &str = "ffmpeg";

/// Package-manager prefixes checked before `$PATH`.
#[cfg(unix)]
const PREFIXES: &[&str] = &["/usr/bin", "/usr/local/bin", "/opt/homebrew/bin"];
#[cfg(not(unix))]
const PREFIXES: &[&str] = &[];

fn install_locations() -> Vec<PathBuf> {
    let home_bin = dirs::home_dir().map(|home| home.join(".local").join("bin"));
    PREFIXES
        .iter()
        .map(PathBuf::from)
        .chain(home_bin)
        .map(|dir| dir.join(BINARY))
        .collect()
}

/// True when `path` is a file whose `-version` output names ffmpeg.
fn runs_as_ffmpeg(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }

    match Command::new(path).arg("-version").output() {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
            .to_lowercase()
            .contains("ffmpeg"),
        _ => false,
    }
}

fn search_path() -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(BINARY))
        .find(|path| path.is_file())
}
