//! cachenix CLI Application
//!
//! Entry point of the CI steps: restores the Nix store and other paths
//! from the remote cache, saves them after the job, and keeps the cache
//! tidy by purging stale entries and collecting local store garbage.

// CLI binary reports fatal errors on stderr
#![allow(clippy::print_stderr)]

mod actions;
mod cli;
mod commands;
mod errors;
mod settings;
mod tracing;

use crate::errors::EXIT_FAILURE;
use crate::settings::Settings;
use crate::tracing::TracingConfig;

#[tokio::main]
async fn main() {
    // Set up error handling first
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Application panicked: {panic_info}");
        eprintln!("Internal error occurred. Run with --log-level debug for more information.");
    }));

    if let Err(error) = run_main().await {
        eprintln!("{error:?}");
        std::process::exit(EXIT_FAILURE);
    }
}

async fn run_main() -> miette::Result<()> {
    let cli = cli::parse();

    crate::tracing::init_tracing(TracingConfig {
        format: cli.log_format,
        level: cli.log_level.into(),
        ..TracingConfig::default()
    })?;

    let settings = Settings::from_env();
    commands::execute(cli.command, &settings).await?;
    Ok(())
}
