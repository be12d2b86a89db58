//! Logging infrastructure for telepipe
//!
//! Logs are written to `~/.local/state/telepipe/telepipe.log.<date>` following
//! XDG standards. The library never installs a subscriber on its own; hosts
//! call [`init`] (or [`init_in`] to pick the directory).

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Prefix of every log file; the appender adds the rotation date
pub const LOG_FILE_PREFIX: &str = "telepipe.log";

/// Initialize the logging system in the XDG state directory
///
/// Sets up tracing with:
/// - File output to XDG state directory
/// - Daily rotation, keeping `max_files` files
/// - Configurable log level via config or RUST_LOG env var
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    init_in(config, &Config::state_dir())
}

/// Initialize the logging system, writing files under `log_dir`
///
/// Fails if a global subscriber is already installed.
pub fn init_in(config: &LoggingConfig, log_dir: &Path) -> Result<LoggingGuard> {
    // The state directory may not exist on a fresh install
    std::fs::create_dir_all(log_dir)?;

    // Old files beyond max_files are pruned on rotation
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(config.max_files.max(1))
        .build(log_dir)
        .map_err(|e| Error::Config(format!("failed to create log appender: {}", e)))?;

    // Telemetry is logged from hot paths, so writes go through a worker thread
    let (writer, worker) = tracing_appender::non_blocking(file_appender);

    // RUST_LOG wins over the configured level
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| Error::Config(format!("invalid log level '{}': {}", config.level, e)))?,
    };

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("failed to install subscriber: {}", e)))?;

    tracing::info!(
        log_dir = %log_dir.display(),
        level = %config.level,
        max_files = config.max_files,
        "Logging initialized"
    );

    Ok(LoggingGuard {
        log_dir: log_dir.to_path_buf(),
        _worker: worker,
    })
}

/// Initialize logging for tests (logs to the test writer)
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("telepipe_core=debug")),
        )
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// Keeps the background log writer alive
///
/// Dropping it flushes pending writes to disk.
pub struct LoggingGuard {
    log_dir: PathBuf,
    _worker: tracing_appender::non_blocking::WorkerGuard,
}

impl LoggingGuard {
    /// Directory the log files are written to
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

/// Returns the log file path (without the rotation date suffix)
pub fn log_file_path() -> PathBuf {
    Config::log_path()
}
