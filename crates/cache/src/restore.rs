//! Key resolution and restore
//!
//! One run walks three stages: an exact lookup of the primary key, a
//! prefix lookup over the first-match keys when the primary key did not
//! hit, and a best-effort restore of every entry under the all-matches
//! prefixes when the primary lookup found nothing at all.

use crate::cache::Cache;
use crate::config::{CacheConfig, FailCondition, LookupStage};
use crate::error::{Error, Result};
use crate::matching::{dedup_by_key, is_exact_match, sort_newest_first};
use crate::state::{STATE_PRIMARY_KEY, STATE_RESTORED_KEY, StateStore};
use cachenix_remote::CacheEntry;
use serde::Serialize;
use tracing::{info, instrument, warn};

/// What a restore run found and restored
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreOutcome {
    /// The primary key matched exactly
    pub hit_primary_key: bool,
    /// A first-match prefix matched
    pub hit_first_match: bool,
    /// Key restored by the primary or first-match stage
    pub restored_key: Option<String>,
    /// Every key restored, in restore order
    pub restored_keys: Vec<String>,
}

impl RestoreOutcome {
    /// Either the primary key or a first-match prefix hit
    #[must_use]
    pub const fn hit(&self) -> bool {
        self.hit_primary_key || self.hit_first_match
    }
}

/// Runs key resolution for one workflow
pub struct Restorer<'a> {
    cache: &'a Cache,
    config: &'a CacheConfig,
    state: &'a dyn StateStore,
}

impl<'a> Restorer<'a> {
    /// Restorer writing hand-off values to `state`
    #[must_use]
    pub fn new(cache: &'a Cache, config: &'a CacheConfig, state: &'a dyn StateStore) -> Self {
        Self {
            cache,
            config,
            state,
        }
    }

    /// Resolve and restore.
    ///
    /// Misses and failed restores are normal outcomes unless the fail-on
    /// policy escalates them. Integrity failures always propagate.
    #[instrument(skip(self), fields(primary_key = %self.config.primary_key))]
    pub async fn run(&self) -> Result<RestoreOutcome> {
        let mut outcome = RestoreOutcome::default();

        if !self.cache.is_available() {
            warn!(
                backend = self.cache.backend().name(),
                "Cache service is not available, skipping restore"
            );
            return Ok(outcome);
        }

        let primary_key = self.config.primary_key.as_str();
        self.state.set(STATE_PRIMARY_KEY, primary_key)?;

        info!("Searching for a cache with the primary key");
        let looked_up = self.lookup(&[primary_key.to_string()]).await?;

        match &looked_up {
            None => {
                self.escalate(LookupStage::Primary, FailCondition::Miss)?;
                info!("Could not find a cache with the given key and paths");
            }
            Some(entry) if is_exact_match(primary_key, &entry.key) => {
                info!("Found a cache with the primary key");
                outcome.hit_primary_key = true;

                if self.config.restore.skip_restore_on_hit_primary_key {
                    info!("Skipping restore of the primary key hit");
                } else {
                    self.restore_stage(LookupStage::Primary, entry, &mut outcome)
                        .await?;
                }
            }
            Some(entry) => {
                info!(matched = %entry.key, "Primary key lookup matched a different key, ignoring");
            }
        }

        let prefixes = &self.config.restore.first_match_keys;
        if !prefixes.is_empty() && !outcome.hit_primary_key {
            info!(?prefixes, "Searching for a cache using the first-match keys");
            match self.lookup(prefixes).await? {
                None => {
                    self.escalate(LookupStage::FirstMatch, FailCondition::Miss)?;
                    info!("Could not find a cache using the first-match keys");
                }
                Some(entry) => {
                    info!(matched = %entry.key, "Found a cache using the first-match keys");
                    outcome.hit_first_match = true;
                    self.restore_stage(LookupStage::FirstMatch, &entry, &mut outcome)
                        .await?;
                }
            }
        }

        if looked_up.is_none() {
            self.restore_all_matches(&mut outcome).await?;
        }

        self.state.set(
            STATE_RESTORED_KEY,
            outcome.restored_key.as_deref().unwrap_or_default(),
        )?;

        info!(
            hit_primary_key = outcome.hit_primary_key,
            hit_first_match = outcome.hit_first_match,
            restored_keys = ?outcome.restored_keys,
            "Finished restoring"
        );
        Ok(outcome)
    }

    /// Lookup where a transfer failure degrades to a miss
    async fn lookup(&self, keys: &[String]) -> Result<Option<CacheEntry>> {
        match self.cache.lookup(keys).await {
            Ok(entry) => Ok(entry),
            Err(e) if e.is_integrity_failure() => Err(e),
            Err(e) => {
                warn!(error = %e, ?keys, "Cache lookup failed, treating it as a miss");
                Ok(None)
            }
        }
    }

    async fn restore_stage(
        &self,
        stage: LookupStage,
        entry: &CacheEntry,
        outcome: &mut RestoreOutcome,
    ) -> Result<()> {
        info!(key = %entry.key, "Restoring a cache");
        match self.cache.restore_entry(entry).await {
            Ok(_) => {
                info!(key = %entry.key, "Finished restoring the cache");
                outcome.restored_key = Some(entry.key.clone());
                outcome.restored_keys.push(entry.key.clone());
                Ok(())
            }
            Err(e) if e.is_integrity_failure() => Err(e),
            Err(e) => {
                warn!(key = %entry.key, error = %e, "Failed to restore the cache");
                self.escalate(stage, FailCondition::NotRestored)
            }
        }
    }

    async fn restore_all_matches(&self, outcome: &mut RestoreOutcome) -> Result<()> {
        let prefixes = &self.config.restore.all_matches_keys;
        if prefixes.is_empty() {
            return Ok(());
        }

        info!(?prefixes, "Restoring caches matching the all-matches keys");
        let mut found = Vec::new();
        for prefix in prefixes {
            match self.cache.list(prefix).await {
                Ok(mut entries) => {
                    sort_newest_first(&mut entries);
                    found.extend(entries);
                }
                Err(e) => warn!(%prefix, error = %e, "Failed to list caches"),
            }
        }
        let found = dedup_by_key(found);
        info!(count = found.len(), "Found caches to restore");

        for entry in found {
            if outcome.restored_keys.contains(&entry.key) {
                continue;
            }
            match self.cache.restore_key(&entry.key).await {
                Ok(Some(key)) => {
                    info!(%key, "Restored a cache");
                    outcome.restored_keys.push(key);
                }
                Ok(None) => info!(key = %entry.key, "Cache disappeared before it could be restored"),
                Err(e) if e.is_integrity_failure() => return Err(e),
                Err(e) => warn!(key = %entry.key, error = %e, "Failed to restore a cache"),
            }
        }
        Ok(())
    }

    fn escalate(&self, stage: LookupStage, condition: FailCondition) -> Result<()> {
        if !self.config.restore.fails_on(stage, condition) {
            return Ok(());
        }
        let policy = format!("{}.{}", stage.as_str(), condition.as_str());
        Err(match condition {
            FailCondition::Miss => Error::CacheMiss { policy },
            FailCondition::NotRestored => Error::NotRestored { policy },
        })
    }
}
