//! Logging for Skiff sessions.
//!
//! The console shows what the user asked for. Each run also rewrites a log
//! file holding every registry and engine event at TRACE, so a torrent that
//! ended up in the wrong state can be traced back through its reports.

use std::fs::{File, create_dir_all};
use std::io;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Name of the per-run log file inside the logs directory.
pub const LOG_FILE_NAME: &str = "skiff-last-run.log";

/// Dependencies whose own logging drowns out registry events.
const QUIET_TARGETS: &[(&str, Level)] = &[
    ("hyper", Level::WARN),
    ("hyper_util", Level::WARN),
    ("reqwest", Level::INFO),
    ("h2", Level::WARN),
];

/// Errors raised while installing the subscriber.
#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    #[error("Cannot write run log {path}: {source}")]
    RunLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("A global subscriber is already installed: {0}")]
    AlreadyInstalled(#[from] tracing_subscriber::util::TryInitError),
}

/// Installs the console and run-log layers.
///
/// `RUST_LOG` replaces `console_level` for the console when set. The run log
/// goes to `logs_dir`, or `./logs` without one, and is truncated each run.
///
/// # Errors
/// - `TracingError::RunLog` - Logs directory or file could not be created
/// - `TracingError::AlreadyInstalled` - Called twice in one process
pub fn init_tracing(console_level: Level, logs_dir: Option<&Path>) -> Result<PathBuf, TracingError> {
    let (log_file, log_path) = open_run_log(logs_dir.unwrap_or_else(|| Path::new("logs")))?;

    let console = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(console_level)));
    let console_layer = fmt::layer()
        .with_target(false)
        .with_writer(io::stderr)
        .with_filter(console);

    let run_log_layer = fmt::layer()
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::new(filter_directives(Level::TRACE)));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(run_log_layer)
        .try_init()?;

    tracing::debug!(
        "Logging to console at {} and to {}",
        console_level,
        log_path.display()
    );
    Ok(log_path)
}

fn open_run_log(dir: &Path) -> Result<(File, PathBuf), TracingError> {
    let path = dir.join(LOG_FILE_NAME);
    let run_log_error = |source| TracingError::RunLog {
        path: path.clone(),
        source,
    };
    create_dir_all(dir).map_err(run_log_error)?;
    let file = File::create(&path).map_err(run_log_error)?;
    Ok((file, path))
}

/// Filter directives for `level`, with chatty dependencies capped.
fn filter_directives(level: Level) -> String {
    let mut directives = level.to_string().to_lowercase();
    for (target, cap) in QUIET_TARGETS {
        let capped = if level < *cap { level } else { *cap };
        directives.push_str(&format!(",{target}={}", capped.to_string().to_lowercase()));
    }
    directives
}

/// Console verbosity chosen on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    Info,
    /// Registry decisions, e.g. ignored reports and auto-resumes
    Debug,
    /// Every engine report
    Trace,
}

impl CliLogLevel {
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}
