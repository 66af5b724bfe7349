//! Selection and deletion of stale remote entries
//!
//! Candidates are the entries under the configured purge prefixes whose
//! last-access or creation time is older than the configured maximum age,
//! measured from one reference time captured by the caller. Deletes are
//! independent: a failed delete is logged and the batch continues.

use crate::cache::Cache;
use crate::config::{PurgeOverwrite, PurgePolicy};
use crate::matching::is_exact_match;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Concurrent delete calls in a live purge
const DELETE_CONCURRENCY: usize = 8;

/// Whether a purge deletes what it selects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PurgeMode {
    /// Select only
    DryRun,
    /// Select and delete
    Live,
}

/// Timestamp an age threshold is applied to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgeField {
    /// When the service last served the entry
    LastAccessed,
    /// When the entry was created
    Created,
}

impl AgeField {
    const fn verb(self) -> &'static str {
        match self {
            Self::LastAccessed => "last accessed",
            Self::Created => "created",
        }
    }
}

/// One selected entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeCandidate {
    /// Entry key
    pub key: String,
    /// Field that put it over the threshold
    pub reason: AgeField,
    /// Value of that field
    pub at: DateTime<Utc>,
}

/// Result of a purge pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    /// Mode the pass ran in
    pub mode: PurgeMode,
    /// Selected entries, one per key
    pub selected: Vec<PurgeCandidate>,
    /// Keys whose delete succeeded
    pub deleted: Vec<String>,
    /// Keys whose delete failed
    pub failed: Vec<String>,
}

impl PurgeReport {
    fn empty(mode: PurgeMode) -> Self {
        Self {
            mode,
            selected: Vec::new(),
            deleted: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// Whether `key` was selected
    #[must_use]
    pub fn selects(&self, key: &str) -> bool {
        self.selected.iter().any(|c| is_exact_match(key, &c.key))
    }

    /// Selected keys in selection order
    #[must_use]
    pub fn selected_keys(&self) -> Vec<&str> {
        self.selected.iter().map(|c| c.key.as_str()).collect()
    }
}

/// Applies a purge policy against one reference time
pub struct Purger<'a> {
    cache: &'a Cache,
    policy: &'a PurgePolicy,
    now: DateTime<Utc>,
}

impl<'a> Purger<'a> {
    /// Purger measuring ages from `now`
    #[must_use]
    pub const fn new(cache: &'a Cache, policy: &'a PurgePolicy, now: DateTime<Utc>) -> Self {
        Self { cache, policy, now }
    }

    /// Prefixes to enumerate: the purge keys, plus the primary key in the
    /// default overwrite mode
    #[must_use]
    pub fn candidate_prefixes(&self, primary_key: &str) -> Vec<String> {
        let mut prefixes: Vec<String> = self
            .policy
            .keys
            .iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        if self.policy.overwrite == PurgeOverwrite::Default
            && !primary_key.is_empty()
            && !prefixes.iter().any(|p| p == primary_key)
        {
            prefixes.push(primary_key.to_string());
        }
        prefixes
    }

    /// Select entries past either age threshold and, in live mode, delete
    /// them.
    ///
    /// The primary key is dropped from the selection when `exempt_primary`
    /// is set or the overwrite mode is `never`.
    #[instrument(skip(self), fields(now = %self.now))]
    pub async fn run(&self, primary_key: &str, mode: PurgeMode, exempt_primary: bool) -> PurgeReport {
        let mut report = PurgeReport::empty(mode);
        if !self.policy.enabled {
            return report;
        }

        let prefixes = self.candidate_prefixes(primary_key);
        if prefixes.is_empty() {
            info!("No purge keys configured");
            return report;
        }

        let thresholds = [
            (AgeField::LastAccessed, self.policy.last_accessed_max_age()),
            (AgeField::Created, self.policy.created_max_age()),
        ];
        for (field, max_age) in thresholds {
            let Some(max_age) = max_age else { continue };
            for candidate in self.select(&prefixes, field, max_age).await {
                if !report.selected.iter().any(|c| c.key == candidate.key) {
                    report.selected.push(candidate);
                }
            }
        }

        let exempt = exempt_primary || self.policy.overwrite == PurgeOverwrite::Never;
        if exempt {
            report
                .selected
                .retain(|c| !is_exact_match(primary_key, &c.key));
        }

        info!(
            count = report.selected.len(),
            keys = ?report.selected_keys(),
            "Selected caches to purge"
        );

        if mode == PurgeMode::Live {
            let keys: Vec<String> = report.selected.iter().map(|c| c.key.clone()).collect();
            let (deleted, failed) = self.delete_keys(keys).await;
            report.deleted = deleted;
            report.failed = failed;
        }
        report
    }

    /// Entries under `prefixes` whose `field` is older than `now - max_age`
    async fn select(
        &self,
        prefixes: &[String],
        field: AgeField,
        max_age: Duration,
    ) -> Vec<PurgeCandidate> {
        let max_date = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| self.now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        info!(
            before = %max_date.to_rfc3339(),
            ?prefixes,
            "Searching for caches {} before the threshold",
            field.verb()
        );

        let mut selected = Vec::new();
        for prefix in prefixes {
            let entries = match self.cache.list(prefix).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(%prefix, error = %e, "Failed to list caches for purging");
                    continue;
                }
            };
            for entry in entries {
                let at = match field {
                    AgeField::LastAccessed => entry.last_accessed_at,
                    AgeField::Created => entry.created_at,
                };
                match at {
                    Some(at) if at < max_date => selected.push(PurgeCandidate {
                        key: entry.key,
                        reason: field,
                        at,
                    }),
                    Some(at) => {
                        info!(key = %entry.key, at = %at.to_rfc3339(), "Keeping cache {}", field.verb());
                    }
                    None => {}
                }
            }
        }
        selected
    }

    /// Delete exactly `key`, logging a failure
    pub async fn purge_key(&self, key: &str) -> bool {
        match self.cache.delete(key).await {
            Ok(()) => {
                info!(%key, "Deleted cache");
                true
            }
            Err(e) => {
                warn!(%key, error = %e, "Failed to delete the cache");
                false
            }
        }
    }

    async fn delete_keys(&self, keys: Vec<String>) -> (Vec<String>, Vec<String>) {
        let results: Vec<(String, bool)> = stream::iter(keys)
            .map(|key| async move {
                let deleted = self.purge_key(&key).await;
                (key, deleted)
            })
            .buffer_unordered(DELETE_CONCURRENCY)
            .collect()
            .await;

        let mut deleted = Vec::new();
        let mut failed = Vec::new();
        for (key, ok) in results {
            if ok {
                deleted.push(key);
            } else {
                failed.push(key);
            }
        }
        deleted.sort();
        failed.sort();
        (deleted, failed)
    }
}
