//! Command execution
//!
//! Each command builds its configuration once, wires the backend, archiver
//! and state store together and runs one workflow.

use crate::actions::GithubActionsIo;
use crate::cli::{CacheInputs, Commands};
use crate::errors::CliError;
use crate::settings::{Settings, gc_max_store_size};
use cachenix_cache::{
    Cache, CacheConfig, HostOs, NullStateStore, PurgeMode, Purger, Restorer, SaveOutcome, Saver,
    StateStore, TarZstdArchiver,
};
use cachenix_remote::create_backend;
use cachenix_store::{NixStoreCli, StoreCollector, collect_garbage};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Run a parsed command
pub async fn execute(command: Commands, settings: &Settings) -> Result<(), CliError> {
    match command {
        Commands::Restore { inputs } => restore(settings, &inputs, true).await,
        Commands::RestoreOnly { inputs } => restore(settings, &inputs, false).await,
        Commands::Save { inputs } => save(settings, &inputs).await,
        Commands::Purge { inputs, dry_run } => purge(settings, &inputs, dry_run).await,
        Commands::Gc { inputs } => gc(&inputs).await,
    }
}

fn build_cache(settings: &Settings, inputs: &CacheInputs) -> Result<(CacheConfig, Cache), CliError> {
    let config = settings.cache_config(inputs, HostOs::current())?;
    let backend = create_backend(settings.backend_config(inputs)?)?;
    let archiver = Arc::new(TarZstdArchiver::new(&config.archive_root));
    let cache = Cache::new(&config, backend, archiver, settings.home.as_deref())?;
    Ok((config, cache))
}

fn warn_invalid_event() {
    warn!(
        "Event Validation Error: the event is not supported because it's not tied to a branch or tag ref"
    );
}

#[instrument(skip_all, fields(persist_state))]
async fn restore(
    settings: &Settings,
    inputs: &CacheInputs,
    persist_state: bool,
) -> Result<(), CliError> {
    let io = GithubActionsIo::new(settings);
    if !settings.is_valid_event() {
        warn_invalid_event();
        return io.reset_restore_outputs();
    }

    let result = async {
        let (config, cache) = build_cache(settings, inputs)?;
        let state: &dyn StateStore = if persist_state { &io } else { &NullStateStore };
        Ok::<_, CliError>(Restorer::new(&cache, &config, state).run().await?)
    }
    .await;

    match result {
        Ok(outcome) => io.write_restore_outputs(&outcome),
        Err(e) => {
            if let Err(reset) = io.reset_restore_outputs() {
                warn!(error = %reset, "Failed to reset outputs");
            }
            Err(e)
        }
    }
}

#[instrument(skip_all)]
async fn save(settings: &Settings, inputs: &CacheInputs) -> Result<(), CliError> {
    if !settings.is_valid_event() {
        warn_invalid_event();
        return Ok(());
    }

    let (config, cache) = build_cache(settings, inputs)?;
    let io = GithubActionsIo::new(settings);
    let collector = NixStoreCli::default();

    let outcome = Saver::new(&cache, &config, &io, Utc::now())
        .with_collector(&collector)
        .run()
        .await?;
    match outcome {
        SaveOutcome::Saved {
            key,
            cache_size,
            purge,
        } => info!(
            %key,
            cache_size,
            purged = purge.deleted.len(),
            "Save finished"
        ),
        SaveOutcome::Skipped(reason) => info!(?reason, "Nothing saved"),
    }
    Ok(())
}

#[instrument(skip_all, fields(dry_run))]
#[allow(clippy::print_stdout)]
async fn purge(settings: &Settings, inputs: &CacheInputs, dry_run: bool) -> Result<(), CliError> {
    let (mut config, cache) = build_cache(settings, inputs)?;
    config.purge.enabled = true;

    let mode = if dry_run {
        PurgeMode::DryRun
    } else {
        PurgeMode::Live
    };
    let report = Purger::new(&cache, &config.purge, Utc::now())
        .run(&config.primary_key, mode, false)
        .await;

    for key in report.selected_keys() {
        println!("{key}");
    }
    if !report.failed.is_empty() {
        warn!(failed = ?report.failed, "Some caches could not be deleted");
    }
    Ok(())
}

#[instrument(skip_all)]
async fn gc(inputs: &CacheInputs) -> Result<(), CliError> {
    let collector = NixStoreCli::default();
    if let Err(e) = collector.remove_stray_files().await {
        warn!(error = %e, "Could not remove stray files under the Nix root");
    }
    let Some(max_size) = gc_max_store_size(inputs, HostOs::current()) else {
        info!("No maximum store size configured, not collecting garbage");
        return Ok(());
    };
    let outcome = collect_garbage(&collector, max_size).await?;
    info!(
        store_size = outcome.store_size,
        max_size = outcome.max_size,
        requested = ?outcome.requested,
        "Garbage collection finished"
    );
    Ok(())
}
