//! Backend-neutral cache entry metadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A remote cache entry as seen by the client.
///
/// Fields the service did not report are `None`; timestamps come from
/// the listing APIs and are absent on plain lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Cache key
    pub key: String,
    /// Version fingerprint the entry was saved with
    pub version: Option<String>,
    /// Branch or ref the entry is scoped to
    pub scope: Option<String>,
    /// Creation time
    pub created_at: Option<DateTime<Utc>>,
    /// Last time the service served this entry
    pub last_accessed_at: Option<DateTime<Utc>>,
    /// Download URL of the archive
    pub archive_location: Option<String>,
    /// Archive size
    pub size_bytes: Option<u64>,
    /// Service-specific identifier
    pub id: Option<String>,
}

impl CacheEntry {
    /// Create an entry carrying only a key
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            version: None,
            scope: None,
            created_at: None,
            last_accessed_at: None,
            archive_location: None,
            size_bytes: None,
            id: None,
        }
    }

    /// Set the version
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Set the archive location
    #[must_use]
    pub fn with_archive_location(mut self, location: impl Into<String>) -> Self {
        self.archive_location = Some(location.into());
        self
    }

    /// Set the creation time
    #[must_use]
    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    /// Set the last access time
    #[must_use]
    pub fn with_last_accessed_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_accessed_at = Some(at);
        self
    }
}
