//! Error types for sql-extractor
//!
//! Errors fall into a small taxonomy that decides how far a failure reaches:
//! - configuration errors abort before any batch is scheduled
//! - batch-fatal errors (the run's cache directory) abort one run
//! - job errors (fetch, write, compression) are isolated to the failing job
//! - upload errors are isolated to the failing job's upload
//! - cleanup errors are logged and never propagated
//!
//! [`ErrorKind`] is the machine-readable form of that taxonomy carried in event payloads.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for sql-extractor operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for sql-extractor
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "format")
        key: Option<String>,
    },

    /// The per-run cache directory could not be created
    #[error("failed to create cache directory {path}: {source}")]
    CacheDir {
        /// Directory that could not be created
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Transport-level failure talking to the remote agent or a webhook
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The remote agent answered with a non-OK status
    #[error("HTTP status {status}{}", format_body(.body))]
    RemoteStatus {
        /// Status code returned by the agent
        status: u16,
        /// Response body, empty if the agent sent none
        body: String,
    },

    /// Transient failures persisted past the configured attempt limit
    #[error("exceeded retry limit after {attempts} attempts: {last}")]
    RetryLimitExceeded {
        /// Number of attempts made
        attempts: u32,
        /// Message of the last failure
        last: String,
    },

    /// The batch was cancelled while the operation was in flight
    #[error("operation cancelled")]
    Cancelled,

    /// Writing the cache file failed
    #[error("error writing {path}: {source}")]
    Write {
        /// Cache file being written
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The gzip compressor failed while encoding or finalizing
    #[error("compression error for {path}: {source}")]
    Compression {
        /// Cache file being compressed
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Object storage operation failed
    #[error("storage error: {0}")]
    Storage(#[from] object_store::Error),

    /// Query file could not be read
    #[error("query error for {path}: {message}")]
    Query {
        /// Query file or directory
        path: PathBuf,
        /// What went wrong
        message: String,
    },

    /// Invalid recurring schedule expression
    #[error("invalid schedule: {0}")]
    Schedule(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration decoding error
    #[error("error decoding config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

fn format_body(body: &str) -> String {
    if body.is_empty() {
        String::new()
    } else {
        format!(": {body}")
    }
}

impl Error {
    /// Shorthand for a configuration error tied to a config key
    pub fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }

    /// Classify this error for downstream event consumers
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config { .. } | Error::Yaml(_) | Error::Query { .. } | Error::Schedule(_) => {
                ErrorKind::Config
            }
            Error::CacheDir { .. } => ErrorKind::Batch,
            Error::Network(_) | Error::RetryLimitExceeded { .. } => ErrorKind::Transport,
            Error::RemoteStatus { .. } => ErrorKind::Remote,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Write { .. } | Error::Io(_) => ErrorKind::Write,
            Error::Compression { .. } => ErrorKind::Compression,
            Error::Storage(_) => ErrorKind::Upload,
            Error::Serialization(_) | Error::Other(_) => ErrorKind::Other,
        }
    }

    /// Whether this error ends the whole run rather than a single job
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Config | ErrorKind::Batch)
    }
}

/// Machine-readable error category carried in event payloads
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid configuration or query definitions
    Config,
    /// Failure preparing the run itself
    Batch,
    /// Connection-level failure reaching the remote agent
    Transport,
    /// Non-OK response from the remote agent
    Remote,
    /// Aborted by cancellation
    Cancelled,
    /// Local cache file could not be written
    Write,
    /// Compressor failure
    Compression,
    /// Durable storage rejected the upload
    Upload,
    /// Anything else
    Other,
}

/// Structured error attached to `extract-ended` and `extract-upload-ended` events
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventError {
    /// Error category
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
}

impl From<&Error> for EventError {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_status_includes_body_when_present() {
        let err = Error::RemoteStatus {
            status: 500,
            body: "relation \"users\" does not exist".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "HTTP status 500: relation \"users\" does not exist"
        );
        assert_eq!(err.kind(), ErrorKind::Remote);
    }

    #[test]
    fn remote_status_without_body() {
        let err = Error::RemoteStatus {
            status: 502,
            body: String::new(),
        };
        assert_eq!(err.to_string(), "HTTP status 502");
    }

    #[test]
    fn only_config_and_cache_dir_errors_are_fatal() {
        assert!(Error::config("format", "unsupported format: xml").is_fatal());
        assert!(
            Error::CacheDir {
                path: PathBuf::from("/nope"),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            }
            .is_fatal()
        );
        assert!(!Error::Cancelled.is_fatal());
        assert!(
            !Error::RemoteStatus {
                status: 500,
                body: String::new()
            }
            .is_fatal()
        );
    }

    #[test]
    fn event_error_serializes_kind_in_snake_case() {
        let err = Error::Compression {
            path: PathBuf::from("/tmp/q.csv.gz"),
            source: std::io::Error::other("boom"),
        };
        let event_error = EventError::from(&err);
        let json = serde_json::to_value(&event_error).unwrap();
        assert_eq!(json["kind"], "compression");
        assert!(json["message"].as_str().unwrap().contains("boom"));
    }
}
