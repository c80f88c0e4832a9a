use std::io::Write;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ffmpeg_progress::config::{self, Config};
use ffmpeg_progress::{ProgressUpdate, Supervisor, SupervisorError};

/// Run ffmpeg with the given arguments, showing only its progress percentage.
#[derive(Parser, Debug)]
#[command(name = "ffmpeg-progress", version)]
struct Cli {
    /// Minimum interval between percentage updates, in milliseconds
    #[arg(long, value_name = "MS")]
    throttle_ms: Option<u64>,

    /// Print every progress block as one JSON object per line
    #[arg(long)]
    json: bool,

    /// Everything that goes after `ffmpeg -progress -`
    #[arg(
        required = true,
        num_args = 1..,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "FFMPEG_ARGS"
    )]
    ffmpeg_args: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env and the config dir env file before reading any variables
    config::load_env_files();

    let cli = Cli::parse();

    // Logs go to stderr, stdout is reserved for progress output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("ffmpeg_progress=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = Config::from_env()?;
    if let Some(ms) = cli.throttle_ms {
        config = config.with_throttle_ms(ms);
    }

    info!(ffmpeg = %config.ffmpeg_path.display(), args = ?cli.ffmpeg_args, "Starting FFmpeg");

    let (tx, rx) = mpsc::unbounded_channel();
    let printer = if cli.json {
        tokio::spawn(print_json(rx))
    } else {
        tokio::spawn(print_percent(rx, config.throttle))
    };

    // The sender lives in the callback and is dropped when the progress channel ends
    let result = Supervisor::with_engine(config.ffmpeg_path.clone(), cli.ffmpeg_args)
        .on_info(move |update: &ProgressUpdate| {
            let _ = tx.send(update.clone());
        })
        .run()
        .await;

    printer.await?;

    match result {
        Ok(outcome) => {
            info!(blocks = outcome.blocks, "FFmpeg finished");
            Ok(ExitCode::SUCCESS)
        }
        Err(SupervisorError::Engine(failure)) => {
            eprintln!("{}", failure);
            error!(exit_status = failure.exit_status, "FFmpeg failed");
            Ok(ExitCode::from(engine_exit_status(failure.exit_status)))
        }
        Err(e) => Err(e.into()),
    }
}

/// Print the integer percentage, at most once per `throttle`.
///
/// Blocks that queue up while sleeping are collapsed into the newest one.
async fn print_percent(mut rx: UnboundedReceiver<ProgressUpdate>, throttle: Duration) {
    let mut stdout = std::io::stdout();

    while let Some(mut update) = rx.recv().await {
        while let Ok(newer) = rx.try_recv() {
            update = newer;
        }

        if let Some(ratio) = update.completion_ratio() {
            let percent = (ratio * 100.0).clamp(0.0, 100.0) as u32;
            let _ = write!(stdout, "              \r{}", percent);
            let _ = stdout.flush();
        }

        // progress=end is how ffmpeg indicates completion
        if update.is_end() {
            let _ = writeln!(stdout);
            break;
        }

        tokio::time::sleep(throttle).await;
    }
}

async fn print_json(mut rx: UnboundedReceiver<ProgressUpdate>) {
    while let Some(update) = rx.recv().await {
        match serde_json::to_string(&update) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!(error = %e, "Failed to serialize progress block"),
        }
    }
}

/// Map an engine exit status onto our own, never reporting success.
fn engine_exit_status(status: i32) -> u8 {
    u8::try_from(status)
        .ok()
        .filter(|code| *code != 0)
        .unwrap_or(1)
}
