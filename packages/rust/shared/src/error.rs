//! Error types for Leadflow.
//!
//! Library crates use [`LeadflowError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Leadflow operations.
#[derive(Debug, thiserror::Error)]
pub enum LeadflowError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// The identifier is registered; the ledger refuses to downgrade it.
    #[error("{identifier} is already registered")]
    AlreadyRegistered { identifier: String },

    /// The ledger already holds a different lead for this identifier.
    #[error(
        "consistency violation for {identifier}: ledger holds lead {existing}, refusing to record {attempted}"
    )]
    ConsistencyViolation {
        identifier: String,
        existing: String,
        attempted: String,
    },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (malformed identifier, bad field, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, LeadflowError>;

impl LeadflowError {
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
        let err = LeadflowError::config("missing base_url");
        assert_eq!(err.to_string(), "config error: missing base_url");

        let err = LeadflowError::validation("identifier has 13 digits");
        assert!(err.to_string().contains("13 digits"));
    }

    #[test]
    fn already_registered_names_identifier() {
        let err = LeadflowError::AlreadyRegistered {
            identifier: "11222333000181".into(),
        };
        assert_eq!(err.to_string(), "11222333000181 is already registered");
    }

    #[test]
    fn consistency_violation_names_both_leads() {
        let err = LeadflowError::ConsistencyViolation {
            identifier: "11222333000181".into(),
            existing: "A".into(),
            attempted: "B".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("11222333000181"));
        assert!(msg.contains("lead A"));
        assert!(msg.contains("record B"));
    }
}
