//! Wire types of the artifact-cache protocol and the GitHub REST cache API

use crate::entry::CacheEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lookup result or listing item of the artifact-cache protocol
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactCacheEntry {
    /// Cache key
    #[serde(default)]
    pub cache_key: Option<String>,
    /// Ref scope
    #[serde(default)]
    pub scope: Option<String>,
    /// Version fingerprint
    #[serde(default)]
    pub cache_version: Option<String>,
    /// RFC 3339 creation time
    #[serde(default)]
    pub creation_time: Option<String>,
    /// Download URL
    #[serde(default)]
    pub archive_location: Option<String>,
}

impl ArtifactCacheEntry {
    /// Convert to the backend-neutral entry; `fallback_key` is used when
    /// the service omits the key
    #[must_use]
    pub fn into_entry(self, fallback_key: &str) -> CacheEntry {
        CacheEntry {
            key: self.cache_key.unwrap_or_else(|| fallback_key.to_string()),
            version: self.cache_version,
            scope: self.scope,
            created_at: self.creation_time.as_deref().and_then(parse_timestamp),
            last_accessed_at: None,
            archive_location: self.archive_location,
            size_bytes: None,
            id: None,
        }
    }
}

/// `GET caches?key=` response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactCacheList {
    /// Number of entries with this key
    #[serde(default)]
    pub total_count: u64,
    /// The entries
    #[serde(default)]
    pub artifact_caches: Vec<ArtifactCacheEntry>,
}

/// `POST caches` body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveCacheRequest {
    /// Cache key
    pub key: String,
    /// Version fingerprint
    pub version: String,
    /// Archive size in bytes
    pub cache_size: u64,
    /// Number of chunk URLs wanted
    pub chunks: usize,
}

/// `POST caches` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveCacheResponse {
    /// Upload session handle
    pub upload_id: String,
    /// One URL per chunk, in byte order
    #[serde(default)]
    pub urls: Vec<String>,
}

/// One uploaded chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPart {
    /// 1-based chunk number
    pub part_number: usize,
    /// ETag returned by the chunk PUT
    pub e_tag: String,
}

/// `POST commitCache` body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitCacheRequest {
    /// Cache key
    pub key: String,
    /// Version fingerprint
    pub version: String,
    /// Upload session handle
    pub upload_id: String,
    /// Final archive size
    pub cache_size: u64,
    /// Chunks in part order
    pub parts: Vec<UploadPart>,
    /// Time spent uploading
    pub upload_time_ms: u64,
    /// Time spent creating the archive
    pub archive_time_ms: u64,
}

/// `POST cacheRestoreReport` body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRestoreReport {
    /// Restored key
    pub cache_key: String,
    /// Version fingerprint
    pub cache_version: String,
    /// Ref scope
    pub scope: String,
    /// Archive size in bytes
    pub size: u64,
    /// Ranged connections used
    pub download_concurrency: usize,
    /// Time spent downloading
    pub download_time_ms: u64,
    /// Time spent extracting
    pub extract_time_ms: u64,
}

/// Item of the GitHub REST `actions/caches` listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GithubCache {
    /// Numeric cache id
    #[serde(default)]
    pub id: Option<u64>,
    /// Ref scope
    #[serde(default, rename = "ref")]
    pub git_ref: Option<String>,
    /// Cache key
    #[serde(default)]
    pub key: Option<String>,
    /// Version fingerprint
    #[serde(default)]
    pub version: Option<String>,
    /// Last access time
    #[serde(default)]
    pub last_accessed_at: Option<DateTime<Utc>>,
    /// Creation time
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Archive size
    #[serde(default)]
    pub size_in_bytes: Option<u64>,
}

impl GithubCache {
    /// Convert to the backend-neutral entry; items without a key are dropped
    #[must_use]
    pub fn into_entry(self) -> Option<CacheEntry> {
        Some(CacheEntry {
            key: self.key?,
            version: self.version,
            scope: self.git_ref,
            created_at: self.created_at,
            last_accessed_at: self.last_accessed_at,
            archive_location: None,
            size_bytes: self.size_in_bytes,
            id: self.id.map(|id| id.to_string()),
        })
    }
}

/// One page of the GitHub REST `actions/caches` listing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GithubCacheList {
    /// Total entries across all pages
    #[serde(default)]
    pub total_count: u64,
    /// Entries on this page
    #[serde(default)]
    pub actions_caches: Vec<GithubCache>,
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_entry_camel_case() {
        let json = r#"{
            "cacheKey": "linux-v1",
            "scope": "refs/heads/main",
            "cacheVersion": "abc",
            "creationTime": "2024-05-01T10:00:00Z",
            "archiveLocation": "https://blob.example.com/a"
        }"#;
        let entry: ArtifactCacheEntry = serde_json::from_str(json).unwrap();
        let entry = entry.into_entry("fallback");
        assert_eq!(entry.key, "linux-v1");
        assert_eq!(entry.archive_location.as_deref(), Some("https://blob.example.com/a"));
        assert!(entry.created_at.is_some());
    }

    #[test]
    fn test_commit_request_field_names() {
        let request = CommitCacheRequest {
            key: "k".into(),
            version: "v".into(),
            upload_id: "u".into(),
            cache_size: 10,
            parts: vec![UploadPart {
                part_number: 1,
                e_tag: "\"e1\"".into(),
            }],
            upload_time_ms: 5,
            archive_time_ms: 7,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["uploadId"], "u");
        assert_eq!(value["cacheSize"], 10);
        assert_eq!(value["parts"][0]["partNumber"], 1);
        assert_eq!(value["parts"][0]["eTag"], "\"e1\"");
        assert_eq!(value["uploadTimeMs"], 5);
        assert_eq!(value["archiveTimeMs"], 7);
    }

    #[test]
    fn test_github_cache_without_key_is_dropped() {
        let json = r#"{"total_count": 2, "actions_caches": [
            {"id": 1, "ref": "refs/heads/main", "key": "linux-v1",
             "last_accessed_at": "2024-05-01T10:00:00Z", "created_at": "2024-04-01T10:00:00Z",
             "size_in_bytes": 1024},
            {"id": 2}
        ]}"#;
        let list: GithubCacheList = serde_json::from_str(json).unwrap();
        let entries: Vec<_> = list
            .actions_caches
            .into_iter()
            .filter_map(GithubCache::into_entry)
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id.as_deref(), Some("1"));
        assert_eq!(entries[0].scope.as_deref(), Some("refs/heads/main"));
    }
}
