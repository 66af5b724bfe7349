//! Error types for remote cache operations

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const MAX_BODY_CHARS: usize = 512;

/// Error type for remote cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum RemoteError {
    /// Transport-level failure (connect, reset, request timeout)
    #[error("HTTP request for {operation} failed: {source}")]
    #[diagnostic(
        code(cachenix::remote::http),
        help("Check network connectivity to the cache service")
    )]
    Http {
        /// Operation that issued the request
        operation: String,
        /// The underlying client error
        #[source]
        source: reqwest::Error,
    },

    /// The service answered with a non-success status
    #[error("Cache service responded with {status} during {operation}")]
    #[diagnostic(code(cachenix::remote::status))]
    Status {
        /// Operation that issued the request
        operation: String,
        /// HTTP status code
        status: u16,
        /// Response body, truncated
        body: String,
    },

    /// Another job holds the reservation for this key
    #[error("Unable to reserve cache with key {key}, another job may be creating this cache")]
    #[diagnostic(
        code(cachenix::remote::reservation_conflict),
        help("The entry is being saved concurrently; this save can be skipped")
    )]
    ReservationConflict {
        /// The key that could not be reserved
        key: String,
    },

    /// Downloaded byte count does not match the advertised length
    #[error("Incomplete download. Expected file size: {expected}, actual file size: {actual}")]
    #[diagnostic(
        code(cachenix::remote::incomplete_download),
        help("The archive was truncated in transit and cannot be extracted")
    )]
    IncompleteDownload {
        /// Bytes advertised by the server
        expected: u64,
        /// Bytes written locally
        actual: u64,
    },

    /// The server ignored the first-byte range request
    #[error("Range request not supported by server")]
    #[diagnostic(code(cachenix::remote::range_not_supported))]
    RangeNotSupported,

    /// The Content-Range header could not be parsed
    #[error("Content-Range header in server response not in correct format: {header}")]
    #[diagnostic(code(cachenix::remote::content_range))]
    InvalidContentRange {
        /// Raw header value
        header: String,
    },

    /// No bytes arrived within the idle timeout
    #[error("{operation} stalled: no data received for {millis}ms")]
    #[diagnostic(code(cachenix::remote::timeout))]
    Timeout {
        /// Operation that stalled
        operation: String,
        /// Idle threshold in milliseconds
        millis: u64,
    },

    /// A chunk upload response carried no ETag
    #[error("Chunk {part_number} upload response has no ETag header")]
    #[diagnostic(code(cachenix::remote::missing_etag))]
    MissingETag {
        /// 1-based part number
        part_number: usize,
    },

    /// A lookup hit had no archive location
    #[error("Cache entry for {key} has no archive location")]
    #[diagnostic(code(cachenix::remote::missing_location))]
    MissingArchiveLocation {
        /// Key of the malformed entry
        key: String,
    },

    /// Local file I/O failed
    #[error("I/O {operation} failed: {}", path.display())]
    #[diagnostic(
        code(cachenix::remote::io),
        help("Check file permissions and available disk space")
    )]
    Io {
        /// Operation that failed (e.g. "open", "truncate")
        operation: String,
        /// Path involved
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Response or request body could not be (de)serialized
    #[error("Serialization error during {operation}: {message}")]
    #[diagnostic(code(cachenix::remote::serialization))]
    Serialization {
        /// Operation that failed
        operation: String,
        /// Error message
        message: String,
    },

    /// Invalid client configuration
    #[error("Remote configuration error: {0}")]
    #[diagnostic(code(cachenix::remote::config))]
    Config(String),

    /// A spawned transfer task panicked or was cancelled
    #[error("Transfer task failed: {0}")]
    #[diagnostic(code(cachenix::remote::task))]
    Task(String),

    /// Retries were exhausted
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    #[diagnostic(
        code(cachenix::remote::retry_exhausted),
        help("The cache service may be degraded; retry the job later")
    )]
    RetryExhausted {
        /// Operation name
        operation: String,
        /// Attempts made
        attempts: usize,
        /// Message of the last failure
        last_error: String,
    },
}

impl RemoteError {
    /// Create a transport error
    #[must_use]
    pub fn http(operation: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Http {
            operation: operation.into(),
            source,
        }
    }

    /// Create a status error
    #[must_use]
    pub fn status(operation: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        let mut body = body.into();
        if let Some((idx, _)) = body.char_indices().nth(MAX_BODY_CHARS) {
            body.truncate(idx);
        }
        Self::Status {
            operation: operation.into(),
            status,
            body,
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(operation: impl Into<String>, path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Serialization {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create an idle-timeout error
    #[must_use]
    pub fn timeout(operation: impl Into<String>, idle: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            millis: crate::client::http::duration_ms(idle),
        }
    }

    /// Create a retry-exhausted error
    #[must_use]
    pub fn retry_exhausted(
        operation: impl Into<String>,
        attempts: usize,
        last_error: impl Into<String>,
    ) -> Self {
        Self::RetryExhausted {
            operation: operation.into(),
            attempts,
            last_error: last_error.into(),
        }
    }

    /// Whether a retry could plausibly succeed.
    ///
    /// Server errors, `429 Too Many Requests`, transport failures and idle
    /// timeouts are retryable; every other 4xx and all local errors are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { source, .. } => {
                source.is_connect() || source.is_timeout() || source.is_request() || source.is_body()
            }
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Timeout { .. } => true,
            Self::ReservationConflict { .. }
            | Self::IncompleteDownload { .. }
            | Self::RangeNotSupported
            | Self::InvalidContentRange { .. }
            | Self::MissingETag { .. }
            | Self::MissingArchiveLocation { .. }
            | Self::Io { .. }
            | Self::Serialization { .. }
            | Self::Config(_)
            | Self::Task(_)
            | Self::RetryExhausted { .. } => false,
        }
    }

    /// Whether this error means the transferred bytes cannot be trusted
    #[must_use]
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::IncompleteDownload { .. })
    }
}

/// Result type for remote operations
pub type Result<T> = std::result::Result<T, RemoteError>;
