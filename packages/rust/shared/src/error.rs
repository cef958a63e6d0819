//! Error types for Dealflow.
//!
//! Library crates use [`DealflowError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Missing source data and eligibility denials are not errors: they are
//! returned as values (fallback [`ResolvedValue`](crate::ResolvedValue)s and
//! denied [`EligibilityDecision`](crate::EligibilityDecision)s).

use std::path::PathBuf;

/// Top-level error type for all Dealflow operations.
#[derive(Debug, thiserror::Error)]
pub enum DealflowError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// External enrichment engine invocation error (transport, timeout, bad response).
    #[error("engine error: {0}")]
    Engine(String),

    /// Illegal queue state transition or unknown queue item.
    #[error("queue error: {0}")]
    Queue(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Programmer error: malformed path, missing identifier, mismatched records.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, DealflowError>;

impl DealflowError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
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
}
