//! Supervised ffmpeg runs with live progress reporting.
//!
//! A [`Supervisor`] launches `ffmpeg -progress - <args...>` and drains both
//! output pipes concurrently:
//!
//! - stderr is buffered in full (it becomes the error text of a failed run)
//!   and mined for the `Duration:` announcement;
//! - stdout carries the `key=value` progress blocks, which are decoded and
//!   handed to the caller's callbacks together with the completion ratio.
//!
//! Neither pipe is ever left unread while ffmpeg runs, so ffmpeg cannot stall
//! on a full pipe buffer. Blocks that arrive before the input duration is
//! known are queued, not waited on, and go out in order once it settles.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{EngineFailure, SupervisorError};
use crate::util::ffmpeg_discovery::FfmpegPaths;
use crate::util::ffmpeg_progress::{
    completion_ratio, BlockDecoder, Decoded, DurationLine, DurationScanner, ProgressUpdate,
};

/// Called with the completion ratio of every block that carries one.
pub type ProgressCallback = Box<dyn FnMut(f64) + Send + 'static>;

/// Called with every completed progress block.
pub type InfoCallback = Box<dyn FnMut(&ProgressUpdate) + Send + 'static>;

/// Lifecycle of a started run.
///
/// A run that has not been started yet is simply a [`Supervisor`] value;
/// starting it consumes the supervisor, so it can only ever launch once.
#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    /// ffmpeg is running or its pipes are still being drained.
    Running,
    /// ffmpeg exited with status 0.
    Succeeded,
    /// ffmpeg exited with a non-zero status.
    Failed(EngineFailure),
    /// The supervisor lost track of the run (waiting on ffmpeg failed or a
    /// callback panicked).
    Aborted(String),
}

impl RunState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Everything left over from a successful run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub exit_status: i32,
    /// Raw stderr output, complete.
    pub diagnostics: Vec<u8>,
    pub input_duration: Option<f64>,
    /// Number of progress blocks decoded.
    pub blocks: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DurationState {
    Pending,
    Resolved(f64),
    Unavailable,
}

impl DurationState {
    fn seconds(self) -> Option<f64> {
        match self {
            Self::Resolved(seconds) => Some(seconds),
            _ => None,
        }
    }
}

/// Builder for one supervised ffmpeg invocation.
pub struct Supervisor {
    engine: Option<PathBuf>,
    arguments: Vec<String>,
    input_duration: Option<f64>,
    callbacks: Callbacks,
}

impl Supervisor {
    /// Supervise the process-wide discovered ffmpeg binary.
    ///
    /// `arguments` is everything that goes after `ffmpeg -progress -`.
    pub fn new<I, S>(arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            engine: None,
            arguments: arguments.into_iter().map(Into::into).collect(),
            input_duration: None,
            callbacks: Callbacks::default(),
        }
    }

    /// Supervise a specific ffmpeg binary.
    pub fn with_engine<I, S>(engine: impl Into<PathBuf>, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut supervisor = Self::new(arguments);
        supervisor.engine = Some(engine.into());
        supervisor
    }

    pub fn on_progress(mut self, f: impl FnMut(f64) + Send + 'static) -> Self {
        self.callbacks.on_progress = Some(Box::new(f));
        self
    }

    pub fn on_info(mut self, f: impl FnMut(&ProgressUpdate) + Send + 'static) -> Self {
        self.callbacks.on_info = Some(Box::new(f));
        self
    }

    /// Use a known input duration instead of waiting for ffmpeg to announce one.
    pub fn input_duration(mut self, seconds: f64) -> Self {
        self.input_duration = Some(seconds);
        self
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    /// Build the ffmpeg command line.
    pub fn command(&self) -> Result<Command, SupervisorError> {
        let engine = match &self.engine {
            Some(path) => path.clone(),
            None => FfmpegPaths::global()?.ffmpeg.clone(),
        };

        let mut cmd = Command::new(engine);
        cmd.arg("-progress")
            .arg("-")
            .args(&self.arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        Ok(cmd)
    }

    /// Launch ffmpeg and start draining its output.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self) -> Result<RunHandle, SupervisorError> {
        let mut cmd = self.command()?;
        debug!(command = ?cmd, "Running FFmpeg");

        let mut child = cmd.spawn().map_err(SupervisorError::Spawn)?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("ffmpeg stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("ffmpeg stderr was not captured"))?;

        let initial = match self.input_duration {
            Some(seconds) => DurationState::Resolved(seconds),
            None => DurationState::Pending,
        };
        let (duration_tx, duration_rx) = watch::channel(initial);
        let (state_tx, state_rx) = watch::channel(RunState::Running);

        let diagnostics = tokio::spawn(drain_diagnostics(stderr, duration_tx));
        let progress = tokio::spawn(drain_progress(
            stdout,
            duration_rx.clone(),
            self.callbacks,
        ));
        let driver = tokio::spawn(supervise(
            child,
            diagnostics,
            progress,
            duration_rx.clone(),
            state_tx,
        ));

        Ok(RunHandle {
            pid,
            arguments: self.arguments,
            state: state_rx,
            duration: duration_rx,
            driver,
        })
    }

    /// Start ffmpeg and wait for it to finish.
    pub async fn run(self) -> Result<RunOutcome, SupervisorError> {
        self.start()?.wait().await
    }
}

/// A running (or finished) supervised ffmpeg process.
pub struct RunHandle {
    pid: Option<u32>,
    arguments: Vec<String>,
    state: watch::Receiver<RunState>,
    duration: watch::Receiver<DurationState>,
    driver: JoinHandle<Result<RunOutcome, SupervisorError>>,
}

impl RunHandle {
    /// OS process id, as reported at spawn time.
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn state(&self) -> RunState {
        self.state.borrow().clone()
    }

    /// The failure of a finished run; `None` while running or after success.
    pub fn terminal_error(&self) -> Option<EngineFailure> {
        match &*self.state.borrow() {
            RunState::Failed(failure) => Some(failure.clone()),
            _ => None,
        }
    }

    /// Wait until the run reaches a terminal state, without consuming the handle.
    pub async fn exited(&self) -> RunState {
        let mut rx = self.state.clone();
        let finished = rx.wait_for(RunState::is_finished).await.map(|s| s.clone()).ok();
        finished.unwrap_or_else(|| rx.borrow().clone())
    }

    /// Total input duration in seconds.
    ///
    /// Waits for ffmpeg to announce it. Fails with
    /// [`SupervisorError::DurationUnavailable`] once it is clear no
    /// announcement will come.
    pub async fn input_duration(&self) -> Result<f64, SupervisorError> {
        let mut rx = self.duration.clone();
        wait_for_duration(&mut rx)
            .await
            .ok_or(SupervisorError::DurationUnavailable)
    }

    /// Wait for ffmpeg to exit and both pipes to be fully drained.
    pub async fn wait(self) -> Result<RunOutcome, SupervisorError> {
        self.driver
            .await
            .map_err(|e| SupervisorError::Join(e.to_string()))?
    }
}

#[derive(Default)]
struct Callbacks {
    on_progress: Option<ProgressCallback>,
    on_info: Option<InfoCallback>,
}

impl Callbacks {
    fn dispatch(&mut self, update: &ProgressUpdate) {
        if let (Some(on_progress), Some(ratio)) =
            (self.on_progress.as_mut(), update.completion_ratio())
        {
            on_progress(ratio);
        }
        if let Some(on_info) = self.on_info.as_mut() {
            on_info(update);
        }
    }
}

async fn wait_for_duration(rx: &mut watch::Receiver<DurationState>) -> Option<f64> {
    let settled = rx
        .wait_for(|state| *state != DurationState::Pending)
        .await
        .map(|state| *state)
        .ok();
    settled.unwrap_or_else(|| *rx.borrow()).seconds()
}

/// Buffer all of stderr, resolving the input duration along the way.
async fn drain_diagnostics<R>(stream: R, duration: watch::Sender<DurationState>) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buffer = Vec::new();
    let mut line = Vec::new();
    let mut scanner = DurationScanner::new();
    let mut scanning = *duration.borrow() == DurationState::Pending;

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Failed reading FFmpeg stderr");
                break;
            }
        }
        buffer.extend_from_slice(&line);

        if !scanning {
            continue;
        }
        match scanner.scan(&String::from_utf8_lossy(&line)) {
            Some(DurationLine::Seconds(seconds)) => {
                debug!(duration = seconds, "Input duration resolved");
                duration.send_replace(DurationState::Resolved(seconds));
            }
            Some(DurationLine::Unknown) => {
                debug!("FFmpeg reports no input duration");
                duration.send_replace(DurationState::Unavailable);
            }
            None => {}
        }
        scanning = !scanner.is_done();
    }

    // stderr is closed: no announcement can arrive anymore
    duration.send_if_modified(|state| {
        if *state == DurationState::Pending {
            *state = DurationState::Unavailable;
            true
        } else {
            false
        }
    });

    buffer
}

/// Completed blocks waiting for their turn to be dispatched.
struct Backlog {
    queued: VecDeque<ProgressUpdate>,
    callbacks: Callbacks,
    warned_no_duration: bool,
    dispatched: usize,
}

impl Backlog {
    fn new(callbacks: Callbacks) -> Self {
        Self {
            queued: VecDeque::new(),
            callbacks,
            warned_no_duration: false,
            dispatched: 0,
        }
    }

    /// Dispatch queued blocks oldest first, as far as `duration` allows.
    ///
    /// A block with a positive output time cannot go out while the duration
    /// is pending, and nothing behind it may overtake it.
    fn release(&mut self, duration: DurationState) {
        while let Some(update) = self.queued.front_mut() {
            let out_time_us = update.out_time_us().filter(|us| *us > 0);
            if out_time_us.is_some() && duration == DurationState::Pending {
                break;
            }

            if let Some(out_time_us) = out_time_us {
                match duration.seconds() {
                    Some(seconds) => {
                        if let Some(ratio) = completion_ratio(out_time_us, seconds) {
                            update.set_completion_ratio(ratio);
                        }
                    }
                    None if !self.warned_no_duration => {
                        warn!("Input duration unknown, reporting progress without a ratio");
                        self.warned_no_duration = true;
                    }
                    None => {}
                }
            }

            trace!(
                ratio = ?update.completion_ratio(),
                status = ?update.status(),
                "Progress block"
            );
            self.callbacks.dispatch(update);
            self.queued.pop_front();
            self.dispatched += 1;
        }
    }
}

/// Decode progress blocks from stdout and dispatch them in order.
///
/// stdout is read continuously, also while blocks are held back waiting for
/// the input duration. Returns the number of blocks dispatched.
async fn drain_progress<R>(
    stream: R,
    mut duration: watch::Receiver<DurationState>,
    callbacks: Callbacks,
) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    let mut decoder = BlockDecoder::new();
    let mut decoding = true;
    let mut backlog = Backlog::new(callbacks);
    let mut duration_live = true;

    loop {
        let waiting = duration_live
            && !backlog.queued.is_empty()
            && *duration.borrow() == DurationState::Pending;

        // A read interrupted by the duration branch leaves its partial line in `line`
        let read = if waiting {
            tokio::select! {
                read = reader.read_until(b'\n', &mut line) => read,
                changed = duration.changed() => {
                    duration_live = changed.is_ok();
                    backlog.release(*duration.borrow_and_update());
                    continue;
                }
            }
        } else {
            reader.read_until(b'\n', &mut line).await
        };

        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Failed reading FFmpeg progress output");
                break;
            }
        }

        // After the channel signalled closure, keep reading only to keep the pipe empty
        if decoding {
            let text = String::from_utf8_lossy(&line);
            match decoder.feed(&text) {
                Decoded::Pending => {}
                Decoded::Skipped => {
                    warn!(line = %text.trim(), "Ignoring malformed progress line");
                }
                Decoded::Closed => {
                    debug!("Progress channel closed");
                    decoding = false;
                }
                Decoded::Block(update) => {
                    backlog.queued.push_back(update);
                    backlog.release(*duration.borrow_and_update());
                }
            }
        }
        line.clear();
    }

    // stdout is done; stderr closes at the latest when ffmpeg exits
    if !backlog.queued.is_empty() {
        let settled = wait_for_duration(&mut duration)
            .await
            .map_or(DurationState::Unavailable, DurationState::Resolved);
        backlog.release(settled);
    }

    backlog.dispatched
}

/// Own the child until it exits, then publish the terminal state.
async fn supervise(
    mut child: Child,
    diagnostics: JoinHandle<Vec<u8>>,
    progress: JoinHandle<usize>,
    duration: watch::Receiver<DurationState>,
    state: watch::Sender<RunState>,
) -> Result<RunOutcome, SupervisorError> {
    let progress = progress.await;
    let status = child.wait().await;
    let diagnostics = diagnostics.await;
    drop(child);

    let result = finish(progress, status, diagnostics, duration.borrow().seconds());
    let terminal = match &result {
        Ok(_) => RunState::Succeeded,
        Err(SupervisorError::Engine(failure)) => RunState::Failed(failure.clone()),
        Err(other) => RunState::Aborted(other.to_string()),
    };
    state.send_replace(terminal);

    result
}

fn finish(
    progress: Result<usize, tokio::task::JoinError>,
    status: std::io::Result<ExitStatus>,
    diagnostics: Result<Vec<u8>, tokio::task::JoinError>,
    input_duration: Option<f64>,
) -> Result<RunOutcome, SupervisorError> {
    let status = status?;
    let diagnostics = diagnostics.map_err(|e| SupervisorError::Join(e.to_string()))?;
    let blocks = progress.map_err(|e| SupervisorError::Join(e.to_string()))?;
    let exit_status = exit_code(status);

    if exit_status != 0 {
        warn!(exit_status, "FFmpeg exited with failure");
        return Err(EngineFailure::new(exit_status, diagnostics).into());
    }

    debug!(blocks, "FFmpeg finished");
    Ok(RunOutcome {
        exit_status,
        diagnostics,
        input_duration,
        blocks,
    })
}

/// Exit code of the process; `-signal` when it was killed by a signal.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }

    -1
}
