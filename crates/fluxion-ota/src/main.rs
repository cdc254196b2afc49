// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! FluxION OTA - Entry point for the update daemon
//!
//! `run` keeps checking on the configured interval until SIGTERM or Ctrl-C;
//! `check` and `update` do a single pass and exit.

use anyhow::Context;
use clap::{Parser, Subcommand};
use fluxion_ota::config::{DEFAULT_CONFIG_PATH, load_config};
use fluxion_ota::{CheckOutcome, FileFlash, OtaClient, OtaError, Scheduler, UpdateOutcome};
use std::path::PathBuf;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "fluxion-ota", version, about = "Over-the-air updates from GitHub Releases")]
struct Cli {
    /// Path of the JSON config file; created with defaults when missing
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check periodically and install new releases
    Run,

    /// Check once and print the versions
    Check,

    /// Check once and install the release if it is newer
    Update,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fluxion_ota=debug".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let config = load_config(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    info!(
        "Loaded config: {}/{}, firmware pattern {:?}, every {} min",
        config.org, config.repo, config.firmware_name_pattern, config.check_interval_minutes
    );

    let flash = FileFlash::new(&config.flash)?;
    let client = OtaClient::new(config, Box::new(flash))?;

    match cli.command {
        Commands::Run => run_daemon(client).await?,
        Commands::Check => {
            let outcome = client.check().await;
            let status = client.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            match outcome {
                Ok(CheckOutcome::UpdateAvailable(latest)) => {
                    info!("Update available: {latest}");
                }
                Ok(CheckOutcome::UpToDate) => info!("Up to date"),
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Update => match client.check_and_update().await {
            Ok(UpdateOutcome::UpToDate) => info!("Up to date"),
            Ok(UpdateOutcome::Restarting) => info!("Update installed, restart requested"),
            Err(OtaError::NoValidAsset) => warn!("Latest release has no matching firmware"),
            Err(e) => return Err(e.into()),
        },
    }

    Ok(())
}

async fn run_daemon(client: OtaClient) -> anyhow::Result<()> {
    let mut events = client.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => info!("OTA event: {json}"),
                Err(e) => warn!("Unserializable event {}: {e}", event.name()),
            }
        }
    });

    let scheduler = Scheduler::new(client.clone());
    if let Err(e) = scheduler.start_once() {
        warn!("Initial check not started: {e}");
    }
    let periodic = scheduler.start_periodic();

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received"),
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl-C: {e}");
            }
            info!("Ctrl-C received");
        }
    }

    periodic.stop().await;
    if let Err(e) = client.shutdown().await {
        warn!("Shutdown while busy: {e}");
    }
    info!("Shutting down");
    Ok(())
}
