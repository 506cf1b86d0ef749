//! Error types for the harvester.
//!
//! Library crates use [`HarvestError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all harvester operations.
#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Connection-level failure (refused, reset, DNS, body read).
    #[error("network error: {0}")]
    Network(String),

    /// A single network call exceeded its timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Non-success HTTP status.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The search provider answered with an error payload (quota, auth, bad request).
    #[error("provider error: {0}")]
    Provider(String),

    /// Response was not textual/HTML content.
    #[error("invalid content type: {0}")]
    ContentType(String),

    /// Malformed response body.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (unknown entity, empty roster, bad transition, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Whether a failed call is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Transient: timeouts, connection resets, 5xx.
    Retry,
    /// Permanent: provider/auth/quota errors, 4xx, malformed payloads.
    Fail,
}

impl HarvestError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Classify this error for [`crate::RetryPolicy`].
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Network(_) | Self::Timeout(_) => Disposition::Retry,
            Self::Http { status, .. } if *status >= 500 => Disposition::Retry,
            _ => Disposition::Fail,
        }
    }
}
