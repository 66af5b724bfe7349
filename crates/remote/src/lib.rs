//! Remote cache service clients for cachenix
//!
//! This crate talks to the remote cache: it computes the cache version
//! fingerprint, moves archives with chunked uploads and ranged downloads,
//! and exposes both supported services behind the [`CacheBackend`] trait.

#![expect(
    clippy::missing_errors_doc,
    reason = "Error documentation to be added incrementally"
)]

pub mod backend;
pub mod client;
pub mod config;
pub mod entry;
pub mod error;
pub mod retry;
pub mod transfer;
pub mod version;

pub use backend::{
    ActionsBackend, BackendConfig, BackendKind, BuildjetBackend, CacheBackend, RestoreReport,
    SaveRequest, create_backend,
};
pub use client::{ArtifactCacheClient, CommitSummary, GithubCachesClient};
pub use config::{
    ArtifactCacheConfig, DEFAULT_BUILDJET_CACHE_URL, DEFAULT_GITHUB_API_URL, GithubApiConfig,
    RetryConfig, TransferConfig,
};
pub use entry::CacheEntry;
pub use error::{RemoteError, Result};
pub use version::{CacheVersion, CompressionMethod};
