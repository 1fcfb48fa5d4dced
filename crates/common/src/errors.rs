//! Error types shared across certpilot crates
//!
//! Component-specific failures (ACME, proxy control, probing) have their own
//! enums next to the component. This module carries the errors that cross
//! crate boundaries: configuration, IO on well-known paths, and timeouts.

use std::time::Duration;
use thiserror::Error;

/// Main error type for certpilot operations
#[derive(Error, Debug)]
pub enum CertPilotError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A bounded wait expired
    #[error("Timeout: {operation} after {}ms", .elapsed.as_millis())]
    Timeout { operation: String, elapsed: Duration },

    /// IO errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        path: Option<String>,
        #[source]
        source: std::io::Error,
    },

    /// Parsing errors
    #[error("Parse error: {message}")]
    Parse {
        message: String,
        input: Option<String>,
    },

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CertPilotError {
    /// Shorthand for a configuration error without a source
    pub fn config(message: impl Into<String>) -> Self {
        CertPilotError::Config {
            message: message.into(),
            source: None,
        }
    }

    /// IO error annotated with the path involved
    pub fn io(message: impl Into<String>, path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        CertPilotError::Io {
            message: message.into(),
            path: Some(path.as_ref().display().to_string()),
            source,
        }
    }

    /// Whether the failure could succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, CertPilotError::Timeout { .. } | CertPilotError::Io { .. })
    }
}

/// Result alias for operations returning [`CertPilotError`]
pub type CertPilotResult<T> = Result<T, CertPilotError>;
