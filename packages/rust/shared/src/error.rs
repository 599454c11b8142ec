//! Error types for Prospector.
//!
//! Library crates use [`ProspectorError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Prospector operations.
#[derive(Debug, thiserror::Error)]
pub enum ProspectorError {
    /// Missing credentials or unreadable configuration. Fatal at startup.
    #[error("config error: {message}")]
    Config { message: String },

    /// Transient network/provider failure (after retries were exhausted).
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// No source produced any data for an identifier.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed provider response or an illegal state transition.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Local cache database error.
    #[error("storage error: {0}")]
    Storage(String),

    /// A worker task died before producing a result (panic or cancellation).
    #[error("task aborted: {0}")]
    Aborted(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ProspectorError>;

impl ProspectorError {
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

    /// Create a provider-unavailable error.
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::ProviderUnavailable(msg.into())
    }

    /// Create a not-found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Short stable label used as a key in metrics error summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::ProviderUnavailable(_) => "provider_unavailable",
            Self::NotFound(_) => "not_found",
            Self::Validation { .. } => "validation",
            Self::Storage(_) => "storage",
            Self::Aborted(_) => "aborted",
            Self::Io { .. } => "io",
        }
    }
}

/// Cloneable summary of an error raised by one pipeline stage.
///
/// Stages of a per-project pipeline keep going after a failure; the
/// summary travels with the project so the caller can decide later
/// whether the record is still usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub stage: &'static str,
    /// [`ProspectorError::kind`] of the underlying error.
    pub kind: &'static str,
    pub message: String,
}

impl StageFailure {
    pub fn new(stage: &'static str, err: &ProspectorError) -> Self {
        Self {
            stage,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.stage, self.message)
    }
}
