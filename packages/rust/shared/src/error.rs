//! Error types for procwatch.
//!
//! Library crates use [`ProcwatchError`] via `thiserror`.
//! The CLI binary wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all procwatch operations.
#[derive(Debug, thiserror::Error)]
pub enum ProcwatchError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error talking to an external collaborator.
    #[error("network error: {0}")]
    Network(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// LLM API error (transport, status, or response shape).
    #[error("llm error: {0}")]
    Llm(String),

    /// Model returned content a stage could not use as structured output.
    #[error("invalid model output: {0}")]
    InvalidModelOutput(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad state transition, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ProcwatchError>;

impl ProcwatchError {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = ProcwatchError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = ProcwatchError::InvalidModelOutput("triage response was not JSON".into());
        assert!(err.to_string().contains("invalid model output"));
    }
}
