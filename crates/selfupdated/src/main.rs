//! selfupdated - firmware self-update daemon
//!
//! Polls an update endpoint, stages new images on block storage and flashes
//! them into the firmware partition. After activating an image the daemon
//! exits with [`RESTART_EXIT_CODE`] so the service manager (for systemd:
//! `RestartForceExitStatus=10`) starts it again on the new firmware.

#![deny(static_mut_refs)]
#![deny(unused_must_use)]
#![deny(clippy::unwrap_used)]

mod daemon;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use selfupdate_core::UpdaterConfig;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::daemon::{DaemonExit, UpdateDaemon};

/// Exit status reported after a new image was activated
pub const RESTART_EXIT_CODE: u8 = 10;

#[derive(Parser)]
#[command(name = "selfupdated")]
#[command(about = "Firmware self-update daemon")]
#[command(version)]
struct Cli {
    /// Configuration file; created with defaults when missing
    #[arg(
        short,
        long,
        env = "SELFUPDATE_CONFIG",
        default_value = "/etc/selfupdate/selfupdate.json"
    )]
    config: PathBuf,

    /// Run one fetch cycle and one apply cycle, then exit
    #[arg(long)]
    once: bool,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("selfupdated={log_level},selfupdate_core={log_level}").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match run(&cli.config, cli.once).await {
        Ok(DaemonExit::Shutdown) => {
            info!("Stopped");
            ExitCode::SUCCESS
        }
        Ok(DaemonExit::RestartRequested) => {
            info!("Exiting for restart into the new firmware image");
            ExitCode::from(RESTART_EXIT_CODE)
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config_path: &Path, once: bool) -> Result<DaemonExit> {
    info!("Starting selfupdated v{}", env!("CARGO_PKG_VERSION"));

    let config = UpdaterConfig::load_from_path(config_path)
        .await
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    info!(
        "Running firmware {}, staging at {}",
        config.current_version, config.staging_path
    );

    let daemon = UpdateDaemon::new(config);
    if once {
        daemon.run_once().await
    } else {
        daemon.run().await
    }
}
