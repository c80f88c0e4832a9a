//! Decoders for the two ffmpeg output channels.
//!
//! `-progress -` makes ffmpeg write `key=value` lines to stdout, one block per
//! reporting interval, each block closed by a `progress=continue` or
//! `progress=end` line. The total input duration is only announced on stderr,
//! inside the free-form log, as `Duration: 00:01:02.50, start: ...`.

use regex::Regex;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::sync::LazyLock;
use std::time::Duration;

/// Key of the line that closes a progress block.
pub const TERMINATOR_KEY: &str = "progress";

/// Key under which the computed completion ratio is merged into a block.
pub const RATIO_KEY: &str = "done";

/// Media time processed so far, in microseconds.
pub const OUT_TIME_US_KEY: &str = "out_time_us";

/// Same value as `out_time_us`; ffmpeg misnames it but still reports microseconds.
pub const OUT_TIME_MS_KEY: &str = "out_time_ms";

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Duration: (?:(\d+):(\d{1,2}):(\d{1,2})(?:\.(\d+))?|(N/A)),")
        .expect("duration pattern is valid")
});

/// What a `Duration:` announcement on stderr said.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DurationLine {
    /// Total input duration in seconds.
    Seconds(f64),
    /// ffmpeg could not determine the duration (`Duration: N/A`).
    Unknown,
}

/// Look for a `Duration: H:MM:SS.cc,` announcement in one stderr line.
pub fn parse_duration(line: &str) -> Option<DurationLine> {
    let caps = DURATION_RE.captures(line)?;

    if caps.get(5).is_some() {
        return Some(DurationLine::Unknown);
    }

    let hours: f64 = caps.get(1)?.as_str().parse().ok()?;
    let minutes: f64 = caps.get(2)?.as_str().parse().ok()?;
    let seconds: f64 = caps.get(3)?.as_str().parse().ok()?;
    let fraction: f64 = match caps.get(4) {
        Some(digits) => format!("0.{}", digits.as_str()).parse().ok()?,
        None => 0.0,
    };

    Some(DurationLine::Seconds(
        hours * 3600.0 + minutes * 60.0 + seconds + fraction,
    ))
}

/// Scans stderr lines until the first duration announcement.
///
/// Once something was found every further line is ignored, so a second input
/// (or a muxer echoing its own duration) cannot overwrite the first value.
#[derive(Debug, Default)]
pub struct DurationScanner {
    found: Option<DurationLine>,
}

impl DurationScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the announcement the first time one is seen, `None` otherwise.
    pub fn scan(&mut self, line: &str) -> Option<DurationLine> {
        if self.found.is_some() {
            return None;
        }
        self.found = parse_duration(line);
        self.found
    }

    pub fn is_done(&self) -> bool {
        self.found.is_some()
    }
}

/// Value of the terminator line of a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// More blocks follow.
    Continue,
    /// Last block; ffmpeg is done writing progress.
    End,
    /// Anything else ffmpeg might invent later.
    Other(String),
}

impl Status {
    fn from_value(value: &str) -> Self {
        match value {
            "continue" => Self::Continue,
            "end" => Self::End,
            other => Self::Other(other.to_string()),
        }
    }
}

/// One completed progress block.
///
/// Fields keep the order ffmpeg emitted them in. The completion ratio is not
/// part of the wire data; the supervisor fills it in once the input duration
/// is known.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    fields: Vec<(String, String)>,
    completion_ratio: Option<f64>,
}

impl ProgressUpdate {
    /// Value of `key` as ffmpeg sent it.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Insert or overwrite a field, keeping the position of the first occurrence.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn status(&self) -> Option<Status> {
        self.get(TERMINATOR_KEY).map(Status::from_value)
    }

    pub fn is_end(&self) -> bool {
        self.status() == Some(Status::End)
    }

    /// Media time processed so far, in microseconds.
    ///
    /// `None` when neither time key is present or the value is `N/A`.
    pub fn out_time_us(&self) -> Option<i64> {
        self.get(OUT_TIME_US_KEY)
            .or_else(|| self.get(OUT_TIME_MS_KEY))
            .and_then(|v| v.parse().ok())
    }

    /// Processed media time, only once it is positive.
    pub fn out_time(&self) -> Option<Duration> {
        match self.out_time_us() {
            Some(us) if us > 0 => Some(Duration::from_micros(us as u64)),
            _ => None,
        }
    }

    /// Encoding speed relative to realtime (`speed=1.23x`).
    pub fn speed(&self) -> Option<f64> {
        self.get("speed")
            .map(|v| v.trim().trim_end_matches('x'))
            .and_then(|v| v.parse().ok())
    }

    pub fn completion_ratio(&self) -> Option<f64> {
        self.completion_ratio
    }

    /// Record the ratio, also merging it into the fields under [`RATIO_KEY`].
    pub fn set_completion_ratio(&mut self, ratio: f64) {
        self.completion_ratio = Some(ratio);
        self.insert(RATIO_KEY, ratio.to_string());
    }
}

impl Serialize for ProgressUpdate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (key, value) in &self.fields {
            if key == RATIO_KEY {
                continue;
            }
            map.serialize_entry(key, value)?;
        }
        if let Some(ratio) = self.completion_ratio {
            map.serialize_entry(RATIO_KEY, &ratio)?;
        }
        map.end()
    }
}

/// Compute `processed / total` from a microsecond counter and a duration in seconds.
///
/// Returns `None` while the counter is not positive, and for a duration that
/// is zero, negative or NaN: a `Duration: 00:00:00.00` input never gets a ratio.
/// The result is not clamped: an output running past the announced input
/// duration yields a ratio above 1.
pub fn completion_ratio(out_time_us: i64, input_duration: f64) -> Option<f64> {
    if out_time_us <= 0 || input_duration.is_nan() || input_duration <= 0.0 {
        return None;
    }
    Some(out_time_us as f64 / 1_000_000.0 / input_duration)
}

/// Outcome of feeding one stdout line to a [`BlockDecoder`].
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// The line was a field of a block that is still open.
    Pending,
    /// The line closed a block.
    Block(ProgressUpdate),
    /// The line had no `=` and was ignored.
    Skipped,
    /// A blank line: the progress channel is done.
    Closed,
}

/// Accumulates `key=value` lines into [`ProgressUpdate`] blocks.
///
/// Every block starts from an empty builder, so a key missing from one block
/// never inherits the value it had in the previous one.
#[derive(Debug, Default)]
pub struct BlockDecoder {
    current: ProgressUpdate,
}

impl BlockDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, line: &str) -> Decoded {
        let line = line.trim();
        if line.is_empty() {
            return Decoded::Closed;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Decoded::Skipped;
        };
        let key = key.trim();
        let value = value.trim();

        self.current.insert(key, value);

        if key == TERMINATOR_KEY {
            Decoded::Block(std::mem::take(&mut self.current))
        } else {
            Decoded::Pending
        }
    }

    /// Fields received since the last terminator.
    pub fn partial(&self) -> &ProgressUpdate {
        &self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_exact() {
        let line = "  Duration: 01:02:03.50, start: 0.000000, bitrate: 1205 kb/s";
        assert_eq!(parse_duration(line), Some(DurationLine::Seconds(3723.5)));
    }

    #[test]
    fn test_parse_duration_wide_hours_and_fraction() {
        assert_eq!(
            parse_duration("Duration: 123:00:00.125,"),
            Some(DurationLine::Seconds(123.0 * 3600.0 + 0.125))
        );
        assert_eq!(
            parse_duration("Duration: 0:00:10,"),
            Some(DurationLine::Seconds(10.0))
        );
    }

    #[test]
    fn test_parse_duration_not_available() {
        assert_eq!(
            parse_duration("  Duration: N/A, start: 0.000000, bitrate: N/A"),
            Some(DurationLine::Unknown)
        );
    }

    #[test]
    fn test_parse_duration_ignores_other_lines() {
        assert_eq!(parse_duration("Input #0, mov,mp4,m4a, from 'in.mp4':"), None);
        assert_eq!(parse_duration("Duration: 00:00:01.00"), None);
    }

    #[test]
    fn test_scanner_keeps_first_match() {
        let mut scanner = DurationScanner::new();
        assert_eq!(scanner.scan("ffmpeg version 6.1"), None);
        assert!(!scanner.is_done());
        assert_eq!(
            scanner.scan("  Duration: 00:00:10.00, start: 0"),
            Some(DurationLine::Seconds(10.0))
        );
        assert!(scanner.is_done());
        assert_eq!(scanner.scan("  Duration: 00:00:20.00, start: 0"), None);
    }

    #[test]
    fn test_decoder_emits_block_on_terminator() {
        let mut decoder = BlockDecoder::new();
        assert_eq!(decoder.feed("frame=100\n"), Decoded::Pending);
        assert_eq!(decoder.feed("out_time_us=500000"), Decoded::Pending);
        assert_eq!(decoder.feed("speed=1.5x"), Decoded::Pending);

        let Decoded::Block(block) = decoder.feed("progress=continue") else {
            panic!("expected a completed block");
        };
        let keys: Vec<&str> = block.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["frame", "out_time_us", "speed", "progress"]);
        assert_eq!(block.status(), Some(Status::Continue));
        assert_eq!(block.out_time_us(), Some(500_000));
        assert_eq!(block.speed(), Some(1.5));
        assert!(decoder.partial().is_empty());
    }

    #[test]
    fn test_decoder_does_not_leak_keys_between_blocks() {
        let mut decoder = BlockDecoder::new();
        decoder.feed("bitrate=100kbits/s");
        decoder.feed("progress=continue");
        decoder.feed("frame=2");

        let Decoded::Block(block) = decoder.feed("progress=end") else {
            panic!("expected a completed block");
        };
        assert_eq!(block.get("bitrate"), None);
        assert_eq!(block.get("frame"), Some("2"));
        assert!(block.is_end());
    }

    #[test]
    fn test_decoder_blank_and_malformed_lines() {
        let mut decoder = BlockDecoder::new();
        assert_eq!(decoder.feed("frame=1"), Decoded::Pending);
        assert_eq!(decoder.feed("garbage without separator"), Decoded::Skipped);
        assert_eq!(decoder.partial().get("frame"), Some("1"));
        assert_eq!(decoder.feed("   "), Decoded::Closed);
        assert_eq!(decoder.feed(""), Decoded::Closed);
    }

    #[test]
    fn test_value_may_contain_separator() {
        let mut decoder = BlockDecoder::new();
        decoder.feed("stream_0_0_q=-1.0");
        decoder.feed("extra=a=b");
        let Decoded::Block(block) = decoder.feed("progress=continue") else {
            panic!("expected a completed block");
        };
        assert_eq!(block.get("extra"), Some("a=b"));
    }

    #[test]
    fn test_out_time_fallback_and_na() {
        let mut block = ProgressUpdate::default();
        block.insert(OUT_TIME_MS_KEY, "2500000");
        assert_eq!(block.out_time_us(), Some(2_500_000));
        assert_eq!(block.out_time(), Some(Duration::from_millis(2500)));

        block.insert(OUT_TIME_US_KEY, "N/A");
        assert_eq!(block.out_time_us(), None);

        let mut start = ProgressUpdate::default();
        start.insert(OUT_TIME_US_KEY, "-23220");
        assert_eq!(start.out_time(), None);
    }

    #[test]
    fn test_completion_ratio() {
        assert_eq!(completion_ratio(500_000, 10.0), Some(0.05));
        assert_eq!(completion_ratio(10_000_000, 10.0), Some(1.0));
        assert_eq!(completion_ratio(12_000_000, 10.0), Some(1.2));
        assert_eq!(completion_ratio(0, 10.0), None);
        assert_eq!(completion_ratio(-1, 10.0), None);
        assert_eq!(completion_ratio(1, 0.0), None);
        assert_eq!(completion_ratio(1, -3.0), None);
        assert_eq!(completion_ratio(1, f64::NAN), None);
    }

    #[test]
    fn test_ratio_is_merged_and_serialized() {
        let mut block = ProgressUpdate::default();
        block.insert("frame", "10");
        block.insert("progress", "continue");
        block.set_completion_ratio(0.25);

        assert_eq!(block.get(RATIO_KEY), Some("0.25"));
        assert_eq!(block.completion_ratio(), Some(0.25));

        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["frame"], "10");
        assert_eq!(json["done"], 0.25);
    }
}
