//! Error types for the cache crate

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use cachenix_remote::RemoteError;
use cachenix_store::StoreError;
use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during cache operations
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(cachenix::cache::io),
        help("Check file permissions and ensure the path exists")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "create")
        operation: String,
    },

    /// Configuration or validation error
    #[error("Cache configuration error: {message}")]
    #[diagnostic(code(cachenix::cache::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Archive creation or extraction failed
    #[error("Archive error: {message}")]
    #[diagnostic(code(cachenix::cache::archive))]
    Archive {
        /// Error message describing the archive issue
        message: String,
    },

    /// A lookup missed and the fail-on policy escalates it
    #[error("No cache with the given key was found. Exiting as the input fail-on is set to {policy}")]
    #[diagnostic(
        code(cachenix::cache::miss),
        help("Remove or change the fail-on input to continue on a miss")
    )]
    CacheMiss {
        /// The policy that escalated the miss
        policy: String,
    },

    /// A matched entry could not be restored and the fail-on policy escalates it
    #[error("No cache with the given key could be restored. Exiting as the input fail-on is set to {policy}")]
    #[diagnostic(code(cachenix::cache::not_restored))]
    NotRestored {
        /// The policy that escalated the failure
        policy: String,
    },

    /// Remote service failure
    #[error(transparent)]
    #[diagnostic(transparent)]
    Remote(#[from] RemoteError),

    /// Local store failure
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    /// A blocking task panicked or was cancelled
    #[error("Cache task failed: {0}")]
    #[diagnostic(code(cachenix::cache::task))]
    Task(String),
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create an archive error
    #[must_use]
    pub fn archive(msg: impl Into<String>) -> Self {
        Self::Archive {
            message: msg.into(),
        }
    }

    /// Whether the error is a corrupt download or a failed database merge.
    ///
    /// Integrity failures abort the enclosing workflow even where other
    /// transfer failures degrade to a miss.
    #[must_use]
    pub fn is_integrity_failure(&self) -> bool {
        match self {
            Self::Remote(e) => e.is_integrity_failure(),
            Self::Store(e) => e.is_integrity_failure(),
            _ => false,
        }
    }

    /// Whether the error comes from the fail-on policy
    #[must_use]
    pub const fn is_policy_failure(&self) -> bool {
        matches!(self, Self::CacheMiss { .. } | Self::NotRestored { .. })
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_classification() {
        let download = Error::from(RemoteError::IncompleteDownload {
            expected: 10,
            actual: 9,
        });
        assert!(download.is_integrity_failure());

        let merge = Error::from(StoreError::integrity("/tmp/merged.sqlite", "not ok"));
        assert!(merge.is_integrity_failure());

        assert!(!Error::from(RemoteError::RangeNotSupported).is_integrity_failure());
        assert!(!Error::configuration("bad").is_integrity_failure());
    }

    #[test]
    fn test_policy_errors_name_the_policy() {
        let err = Error::CacheMiss {
            policy: "primary.miss".into(),
        };
        assert!(err.is_policy_failure());
        assert!(err.to_string().contains("primary.miss"));
        assert!(err.to_string().starts_with("No cache with the given key was found"));
    }
}
