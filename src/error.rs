//! GitScale Error Types

use std::time::Duration;
use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for GitScale operations
pub type Result<T> = std::result::Result<T, Error>;

/// GitScale error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Executor errors
    #[error("{description} failed with {status}: {stderr}")]
    ExecutorFailed {
        description: String,
        status: String,
        stderr: String,
    },

    #[error("{description} timed out after {timeout:?}")]
    ExecutorTimeout { description: String, timeout: Duration },

    #[error("Argument {0:?} would be interpreted as an option")]
    UnsafeArgument(String),

    // Protocol errors
    #[error("Service {0:?} is not allowed")]
    ServiceNotAllowed(String),

    #[error("Content-Type {actual:?} doesn't match expected {expected:?}")]
    ContentTypeMismatch { expected: String, actual: String },

    #[error("Failed to decode request body: {0}")]
    Decode(String),

    // Replication errors
    #[error("Inbound copy failed after {copied} bytes: {reason}")]
    InboundCopy { copied: u64, reason: String },

    #[error("Out-of-sync marker error for {node}: {reason}")]
    Marker { node: String, reason: String },

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status reported to clients for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::ServiceNotAllowed(_) | Error::ContentTypeMismatch { .. } => {
                StatusCode::UNAUTHORIZED
            }
            Error::InboundCopy { .. } => StatusCode::EXPECTATION_FAILED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
