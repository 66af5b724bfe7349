//! Cache workflows for cachenix
//!
//! This crate drives the remote cache for one CI job:
//! - Key resolution: primary key, first-match prefixes, all-matches prefixes
//! - Restore with store database reconciliation around extraction
//! - Save with local garbage collection and purging of stale entries
//!
//! # Overview
//!
//! A [`Cache`] binds a [`cachenix_remote::CacheBackend`] and an
//! [`Archiver`] to the version fingerprint of the configured paths.
//! [`Restorer`], [`Saver`] and [`Purger`] run the workflows against it,
//! configured by one immutable [`CacheConfig`]. Values that the restore
//! phase hands to the save phase go through a [`StateStore`].

#![expect(
    clippy::missing_errors_doc,
    reason = "Error documentation to be added incrementally"
)]

pub mod archive;
pub mod cache;
pub mod config;
mod error;
pub mod matching;
pub mod purge;
pub mod restore;
pub mod save;
pub mod state;

// Re-export error types at crate root
pub use error::{Error, Result};

// Re-export main types
pub use archive::{ArchiveStats, Archiver, TarZstdArchiver};
pub use cache::Cache;
pub use config::{
    CacheConfig, FailCondition, FailOn, GcPolicy, HostOs, LookupStage, PurgeOverwrite,
    PurgePolicy, RestorePolicy,
};
pub use matching::is_exact_match;
pub use purge::{AgeField, PurgeCandidate, PurgeMode, PurgeReport, Purger};
pub use restore::{RestoreOutcome, Restorer};
pub use save::{SaveOutcome, Saver, SkipReason};
pub use state::{
    MemoryStateStore, NullStateStore, STATE_PRIMARY_KEY, STATE_RESTORED_KEY, StateStore,
};
