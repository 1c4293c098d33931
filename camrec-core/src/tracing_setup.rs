//! Tracing setup for Camrec
//!
//! Console output follows the level the user picked. Everything, including
//! forwarded transcoder stderr at `debug`, also goes to a per-run log file.

use std::fs::{File, create_dir_all};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Log file written by each run, overwriting the previous one.
pub const LOG_FILE_NAME: &str = "camrec-last-run.log";

/// Errors from tracing initialization
#[derive(Debug, Error)]
pub enum TracingSetupError {
    #[error("Cannot prepare log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Global tracing subscriber already set: {0}")]
    AlreadyInitialized(#[from] TryInitError),
}

/// Installs the console and file layers.
///
/// `RUST_LOG` overrides `console_level` for the console only; the file
/// always records at `trace`. Returns the log file path.
///
/// # Errors
///
/// - `TracingSetupError::LogFile` - Log directory or file could not be created
/// - `TracingSetupError::AlreadyInitialized` - A subscriber is already installed
pub fn init_tracing(
    console_level: Level,
    logs_dir: Option<&Path>,
) -> Result<PathBuf, TracingSetupError> {
    let logs_path = logs_dir.unwrap_or_else(|| Path::new("logs"));
    let log_file_path = logs_path.join(LOG_FILE_NAME);

    let log_file = create_dir_all(logs_path)
        .and_then(|()| File::create(&log_file_path))
        .map_err(|source| TracingSetupError::LogFile {
            path: log_file_path.clone(),
            source,
        })?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));
    let console_layer = fmt::layer()
        .with_target(false)
        .with_filter(console_filter);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::new("trace"));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(
        "Tracing initialized: console={}, log_file={}",
        console_level,
        log_file_path.display()
    );

    Ok(log_file_path)
}

/// Console log levels selectable on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    Info,
    /// Includes transcoder stderr
    Debug,
    Trace,
}

impl CliLogLevel {
    /// Corresponding `tracing` level.
    ///
    /// ```
    /// use camrec_core::tracing_setup::CliLogLevel;
    ///
    /// assert_eq!(CliLogLevel::Debug.as_tracing_level(), tracing::Level::DEBUG);
    /// ```
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }

    /// True when the transcoder should log verbosely too.
    pub fn wants_transcoder_output(self) -> bool {
        matches!(self, CliLogLevel::Debug | CliLogLevel::Trace)
    }
}
