//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/telepipe/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/telepipe/` (~/.config/telepipe/)
//! - Data: `$XDG_DATA_HOME/telepipe/` (~/.local/share/telepipe/)
//! - State/Logs: `$XDG_STATE_HOME/telepipe/` (~/.local/state/telepipe/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Batching, staging and delivery settings
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// Telemetry pipeline configuration
#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Collector URL that receives `application/x-json-stream` POSTs
    pub endpoint_url: Option<String>,

    /// Instrumentation key stamped on every envelope (`iKey`)
    pub instrumentation_key: Option<String>,

    /// Events queued in memory before an automatic flush
    #[serde(default = "default_batch_threshold")]
    pub batch_threshold: usize,

    /// Seconds between timer-driven flushes (0 disables the timer)
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Staging directory override
    pub staging_dir: Option<PathBuf>,

    /// Maximum number of staged units kept on disk
    #[serde(default = "default_max_staged_units")]
    pub max_staged_units: usize,

    /// Maximum number of concurrent delivery attempts
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// HTTP connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// HTTP read timeout in milliseconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Status codes that leave a unit staged for another attempt
    #[serde(default = "default_recoverable_status_codes")]
    pub recoverable_status_codes: Vec<u16>,

    /// Lowest status code treated as delivered
    #[serde(default = "default_success_status_min")]
    pub success_status_min: u16,

    /// Highest status code treated as delivered
    #[serde(default = "default_success_status_max")]
    pub success_status_max: u16,

    /// Gzip request bodies
    #[serde(default = "default_gzip")]
    pub gzip: bool,

    /// Seconds between delivery pokes that retry released units (0 disables)
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            instrumentation_key: None,
            batch_threshold: default_batch_threshold(),
            flush_interval_secs: default_flush_interval(),
            staging_dir: None,
            max_staged_units: default_max_staged_units(),
            max_concurrent_requests: default_max_concurrent_requests(),
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
            recoverable_status_codes: default_recoverable_status_codes(),
            success_status_min: default_success_status_min(),
            success_status_max: default_success_status_max(),
            gzip: default_gzip(),
            retry_interval_secs: default_retry_interval(),
        }
    }
}

impl PipelineConfig {
    /// Create a config pointing at `endpoint_url` with every other option defaulted
    pub fn for_endpoint(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: Some(endpoint_url.into()),
            ..Default::default()
        }
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        match self.endpoint_url.as_deref() {
            Some(url) if !url.trim().is_empty() => {}
            _ => {
                return Err(Error::Config(
                    "pipeline.endpoint_url is required".to_string(),
                ))
            }
        }
        if self.batch_threshold == 0 {
            return Err(Error::Config(
                "pipeline.batch_threshold must be at least 1".to_string(),
            ));
        }
        if self.max_staged_units == 0 {
            return Err(Error::Config(
                "pipeline.max_staged_units must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_requests == 0 {
            return Err(Error::Config(
                "pipeline.max_concurrent_requests must be at least 1".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 || self.read_timeout_ms == 0 {
            return Err(Error::Config(
                "pipeline timeouts must be greater than zero".to_string(),
            ));
        }
        if self.success_status_min > self.success_status_max {
            return Err(Error::Config(format!(
                "pipeline.success_status_min ({}) is above success_status_max ({})",
                self.success_status_min, self.success_status_max
            )));
        }
        if let Some(code) = self
            .recoverable_status_codes
            .iter()
            .find(|code| (self.success_status_min..=self.success_status_max).contains(*code))
        {
            return Err(Error::Config(format!(
                "pipeline.recoverable_status_codes contains success status {}",
                code
            )));
        }
        Ok(())
    }

    /// Staging directory, falling back to `$XDG_DATA_HOME/telepipe/telemetry`
    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| Config::data_dir().join("telemetry"))
    }

    /// Get the configured flush interval, if the timer is enabled
    pub fn flush_interval(&self) -> Option<Duration> {
        (self.flush_interval_secs > 0).then(|| Duration::from_secs(self.flush_interval_secs))
    }

    /// Get the configured retry interval, if the periodic poke is enabled
    pub fn retry_interval(&self) -> Option<Duration> {
        (self.retry_interval_secs > 0).then(|| Duration::from_secs(self.retry_interval_secs))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

fn default_batch_threshold() -> usize {
    1
}

fn default_flush_interval() -> u64 {
    15
}

fn default_max_staged_units() -> usize {
    50
}

fn default_max_concurrent_requests() -> usize {
    10
}

fn default_connect_timeout() -> u64 {
    15_000
}

fn default_read_timeout() -> u64 {
    10_000
}

fn default_recoverable_status_codes() -> Vec<u16> {
    vec![408, 429, 500, 503, 511]
}

fn default_success_status_min() -> u16 {
    200
}

fn default_success_status_max() -> u16 {
    203
}

fn default_gzip() -> bool {
    true
}

fn default_retry_interval() -> u64 {
    30
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/telepipe/config.toml` (~/.config/telepipe/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("telepipe").join("config.toml")
    }

    /// Returns the data directory path (parent of the staging directory)
    ///
    /// `$XDG_DATA_HOME/telepipe/` (~/.local/share/telepipe/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("telepipe")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/telepipe/` (~/.local/state/telepipe/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("telepipe")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/telepipe/telepipe.log` (~/.local/state/telepipe/telepipe.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("telepipe.log")
    }
}
