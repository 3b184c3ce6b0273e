//! Error types for catalogsync.
//!
//! Library crates use [`CatalogError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all catalogsync operations.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Malformed input record; rejected before it enters the pipeline.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Network/HTTP error talking to the index or a media URL.
    #[error("network error: {0}")]
    Network(String),

    /// The circuit breaker rejected the call without contacting the sink.
    /// The request has been parked in the retry queue.
    #[error("circuit open for {sink}: request parked for retry")]
    CircuitOpen { sink: String },

    /// Every attempt failed; the request has been parked in the retry queue.
    #[error("delivery deferred after {attempts} attempts: {last_error}")]
    Deferred { attempts: u32, last_error: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Embedding generation error.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// JSON encoding/decoding error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The component has been shut down and no longer accepts work.
    #[error("{component} is shutting down")]
    ShuttingDown { component: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CatalogError>;

impl CatalogError {
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

    /// Create a storage error from any displayable error.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a shutdown error for the named component.
    pub fn shutting_down(component: impl Into<String>) -> Self {
        Self::ShuttingDown {
            component: component.into(),
        }
    }

    /// Whether the work behind this error is still owned by the sink's
    /// retry queue rather than lost.
    pub fn is_parked(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::Deferred { .. })
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
