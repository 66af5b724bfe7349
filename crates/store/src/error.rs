//! Error types for store database and garbage collection operations

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for store operations
#[derive(Error, Debug, Diagnostic)]
pub enum StoreError {
    /// SQLite reported an error
    #[error("Database {operation} failed on {}: {source}", path.display())]
    #[diagnostic(
        code(cachenix::store::database),
        help("Check that the Nix daemon is not holding an exclusive lock on the database")
    )]
    Database {
        /// Operation that failed (e.g. "checkpoint", "merge")
        operation: String,
        /// Database file involved
        path: PathBuf,
        /// The underlying SQLite error
        #[source]
        source: rusqlite::Error,
    },

    /// Local file I/O failed
    #[error("I/O {operation} failed: {}", path.display())]
    #[diagnostic(
        code(cachenix::store::io),
        help("Check permissions on the Nix database directory")
    )]
    Io {
        /// Operation that failed (e.g. "copy", "rename")
        operation: String,
        /// Path involved
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The merged database failed its consistency checks
    #[error("Integrity check failed for {}: {details}", path.display())]
    #[diagnostic(
        code(cachenix::store::integrity),
        help("The merged database was not installed; the live database is unchanged")
    )]
    Integrity {
        /// Database that failed the check
        path: PathBuf,
        /// Problems reported by the engine
        details: String,
    },

    /// An external command could not be started
    #[error("Failed to run {command}: {source}")]
    #[diagnostic(
        code(cachenix::store::command),
        help("Ensure Nix is installed and on PATH")
    )]
    Command {
        /// Command line that was attempted
        command: String,
        /// The underlying spawn error
        #[source]
        source: std::io::Error,
    },

    /// An external command exited unsuccessfully
    #[error("{command} exited with {}: {stderr}", status.map_or_else(|| "a signal".to_string(), |c| format!("status {c}")))]
    #[diagnostic(code(cachenix::store::command_failed))]
    CommandFailed {
        /// Command line that ran
        command: String,
        /// Exit code, if the process exited normally
        status: Option<i32>,
        /// Captured standard error, trimmed
        stderr: String,
    },

    /// An external command printed output that could not be understood
    #[error("Unexpected output from {command}: {message}")]
    #[diagnostic(code(cachenix::store::output))]
    Output {
        /// Command line that ran
        command: String,
        /// What was wrong with the output
        message: String,
    },

    /// A blocking task panicked or was cancelled
    #[error("Store task failed: {0}")]
    #[diagnostic(code(cachenix::store::task))]
    Task(String),
}

impl StoreError {
    /// Create a database error
    #[must_use]
    pub fn database(
        operation: impl Into<String>,
        path: impl AsRef<Path>,
        source: rusqlite::Error,
    ) -> Self {
        Self::Database {
            operation: operation.into(),
            path: path.as_ref().to_path_buf(),
            source,
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

    /// Create an integrity error
    #[must_use]
    pub fn integrity(path: impl AsRef<Path>, details: impl Into<String>) -> Self {
        Self::Integrity {
            path: path.as_ref().to_path_buf(),
            details: details.into(),
        }
    }

    /// Whether this error means a database is corrupt or inconsistent.
    ///
    /// Integrity failures are never retried.
    #[must_use]
    pub const fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::Integrity { .. })
    }
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;
