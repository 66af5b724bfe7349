//! HTTP clients for the cache services

pub mod artifact;
pub mod contracts;
pub mod github;
pub mod http;

pub use artifact::{ArtifactCacheClient, CommitSummary};
pub use github::GithubCachesClient;
