//! Error types for telepipe-core
//!
//! Only construction and configuration paths return these. The runtime
//! paths (log, flush, persist, send) absorb failures and log them instead.

use thiserror::Error;

/// Main error type for the telepipe-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport error (connect, timeout, body write)
    #[error("HTTP error: {0}")]
    Http(String),
}

/// Result type alias for telepipe-core
pub type Result<T> = std::result::Result<T, Error>;
