pub mod ffmpeg_discovery;
pub mod ffmpeg_progress;

pub use ffmpeg_discovery::FfmpegPaths;
pub use ffmpeg_progress::{BlockDecoder, DurationLine, ProgressUpdate, Status};
