//! The save workflow
//!
//! Saves the configured paths under the primary key unless an entry with
//! that key already exists and the purge policy does not evict it. Local
//! garbage collection runs before archiving and a live purge after a
//! successful save. Failures past key resolution are logged as warnings
//! and reported in the outcome.

use crate::cache::Cache;
use crate::config::{CacheConfig, PurgeOverwrite};
use crate::error::{Error, Result};
use crate::matching::is_exact_match;
use crate::purge::{PurgeMode, PurgeReport, Purger};
use crate::state::{STATE_PRIMARY_KEY, StateStore};
use cachenix_remote::RemoteError;
use cachenix_store::{StoreCollector, collect_garbage};
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

/// Why nothing was saved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The cache service is not configured
    Unavailable,
    /// Neither state nor configuration provided a key
    MissingKey,
    /// An entry with the primary key exists and is kept
    ExistingEntry,
    /// Another job holds the reservation for the key
    ReservationConflict,
    /// A step failed; the message was logged as a warning
    Failed(String),
}

/// Result of a save run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// A new entry was committed
    Saved {
        /// Key saved under
        key: String,
        /// Archive size in bytes
        cache_size: u64,
        /// The live purge that followed
        purge: PurgeReport,
    },
    /// Nothing was saved
    Skipped(SkipReason),
}

impl SaveOutcome {
    /// Whether an entry was committed
    #[must_use]
    pub const fn is_saved(&self) -> bool {
        matches!(self, Self::Saved { .. })
    }
}

/// Runs the save workflow
pub struct Saver<'a> {
    cache: &'a Cache,
    config: &'a CacheConfig,
    state: &'a dyn StateStore,
    collector: Option<&'a dyn StoreCollector>,
    now: DateTime<Utc>,
}

impl<'a> Saver<'a> {
    /// Saver whose purge ages are measured from `now`
    #[must_use]
    pub fn new(
        cache: &'a Cache,
        config: &'a CacheConfig,
        state: &'a dyn StateStore,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            cache,
            config,
            state,
            collector: None,
            now,
        }
    }

    /// Collect store garbage through `collector` before archiving
    #[must_use]
    pub fn with_collector(mut self, collector: &'a dyn StoreCollector) -> Self {
        self.collector = Some(collector);
        self
    }

    /// The key to save under: the restore phase's, else the configured one
    #[must_use]
    pub fn primary_key(&self) -> String {
        self.state
            .get(STATE_PRIMARY_KEY)
            .filter(|key| !key.is_empty())
            .unwrap_or_else(|| self.config.primary_key.clone())
    }

    /// Run the workflow
    #[instrument(skip(self), fields(now = %self.now))]
    pub async fn run(&self) -> Result<SaveOutcome> {
        if !self.cache.is_available() {
            warn!(
                backend = self.cache.backend().name(),
                "Cache service is not available, not saving"
            );
            return Ok(SaveOutcome::Skipped(SkipReason::Unavailable));
        }

        let primary_key = self.primary_key();
        if primary_key.is_empty() {
            warn!("Key is not specified");
            return Ok(SaveOutcome::Skipped(SkipReason::MissingKey));
        }

        match self.save(&primary_key).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_integrity_failure() => Err(e),
            Err(Error::Remote(RemoteError::ReservationConflict { key })) => {
                warn!(%key, "Failed to save: another job may be creating this cache");
                Ok(SaveOutcome::Skipped(SkipReason::ReservationConflict))
            }
            Err(e) => {
                warn!(error = %e, "Failed to save");
                Ok(SaveOutcome::Skipped(SkipReason::Failed(e.to_string())))
            }
        }
    }

    async fn save(&self, primary_key: &str) -> Result<SaveOutcome> {
        let purger = Purger::new(self.cache, &self.config.purge, self.now);

        let existing = match self.cache.lookup(&[primary_key.to_string()]).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!(error = %e, "Cache lookup failed, saving without checking for an existing entry");
                None
            }
        };
        if let Some(entry) = existing
            && is_exact_match(primary_key, &entry.key)
        {
            info!(key = %primary_key, "Cache hit occurred on the primary key");
            if !self.replaces_existing(&purger, primary_key).await {
                info!("Not saving a new cache");
                return Ok(SaveOutcome::Skipped(SkipReason::ExistingEntry));
            }
            info!("This cache will be purged. Saving a new cache");
            purger.purge_key(primary_key).await;
        }

        self.collect_garbage().await;

        let summary = self.cache.save(primary_key).await?;
        info!(key = %primary_key, size = summary.cache_size, "Cache saved");

        let purge = purger.run(primary_key, PurgeMode::Live, true).await;
        Ok(SaveOutcome::Saved {
            key: primary_key.to_string(),
            cache_size: summary.cache_size,
            purge,
        })
    }

    async fn replaces_existing(&self, purger: &Purger<'_>, primary_key: &str) -> bool {
        let policy = &self.config.purge;
        if !policy.enabled {
            return false;
        }
        if policy.overwrite == PurgeOverwrite::Always {
            return true;
        }
        purger
            .run(primary_key, PurgeMode::DryRun, false)
            .await
            .selects(primary_key)
    }

    async fn collect_garbage(&self) {
        let Some(collector) = self.collector else {
            return;
        };
        if let Err(e) = collector.remove_stray_files().await {
            warn!(error = %e, "Could not remove stray files under the Nix root");
        }
        let Some(max_size) = self.config.gc.max_store_size else {
            return;
        };
        match collect_garbage(collector, max_size).await {
            Ok(outcome) if outcome.collected() => {
                info!(requested = ?outcome.requested, "Collected store garbage");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Garbage collection failed, saving anyway"),
        }
    }
}
