//! Error type of the cachenix binary and its exit codes

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::io;
use std::path::Path;
use thiserror::Error;

/// Exit code of any failed run
pub const EXIT_FAILURE: i32 = 1;

/// Errors surfaced by the binary
#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    /// Invalid input or environment
    #[error("Configuration error: {message}")]
    #[diagnostic(code(cachenix::cli::config))]
    Config {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },

    /// Writing a CI state or output file failed
    #[error("Failed to {operation} {}", path.display())]
    #[diagnostic(
        code(cachenix::cli::io),
        help("Check that the runner provided a writable file")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: io::Error,
        /// File being written
        path: Box<Path>,
        /// Operation that failed
        operation: String,
    },

    /// A cache workflow failed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Cache(#[from] cachenix_cache::Error),

    /// The remote backend could not be built
    #[error(transparent)]
    #[diagnostic(transparent)]
    Remote(#[from] cachenix_remote::RemoteError),

    /// Local store garbage collection failed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] cachenix_store::StoreError),
}

impl CliError {
    /// Create a configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: None,
        }
    }

    /// Create a configuration error with help text
    #[must_use]
    pub fn config_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: Some(help.into()),
        }
    }

    /// Create an I/O error for `path`
    #[must_use]
    pub fn io(source: io::Error, path: impl AsRef<Path>, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: path.as_ref().into(),
            operation: operation.into(),
        }
    }
}
