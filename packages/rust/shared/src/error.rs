//! Error types for the Aspects sinks.
//!
//! Library crates use [`AspectsError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Aspects operations.
#[derive(Debug, thiserror::Error)]
pub enum AspectsError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// A course key or model id unknown to the content store.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// Malformed opaque key or timestamp.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Content store (libSQL) error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Transport or query error talking to the warehouse.
    #[error("warehouse error: {0}")]
    Warehouse(String),

    /// The warehouse rejected a bulk insert beyond its error threshold.
    #[error("bulk insert into {table} failed after {written_rows} rows: {message}")]
    BulkInsert {
        table: String,
        written_rows: u64,
        message: String,
    },

    /// JSON encoding or decoding error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Task queue closed or a worker failed to join.
    #[error("dispatch error: {0}")]
    Dispatch(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad snapshot, invalid input, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, AspectsError>;

impl AspectsError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a not-found error naming the missing entity.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
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
}

impl From<serde_json::Error> for AspectsError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = AspectsError::config("missing clickhouse url");
        assert_eq!(err.to_string(), "config error: missing clickhouse url");

        let err = AspectsError::not_found("course course-v1:edX+DemoX+Demo");
        assert!(err.to_string().contains("course-v1:edX+DemoX+Demo"));
    }

    #[test]
    fn bulk_insert_error_carries_partial_count() {
        let err = AspectsError::BulkInsert {
            table: "course_blocks".into(),
            written_rows: 42,
            message: "too many parse errors".into(),
        };
        let text = err.to_string();
        assert!(text.contains("course_blocks"));
        assert!(text.contains("42 rows"));
    }
}
