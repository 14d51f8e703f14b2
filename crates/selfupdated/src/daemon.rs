//! Update daemon lifecycle: wiring, signal handling and exit reporting

use std::sync::Arc;

use anyhow::{Context, Result};
use selfupdate_core::prelude::*;
use selfupdate_core::scheduler::{ExitReason, JobExit};
use tracing::{error, info, warn};

/// How the daemon finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonExit {
    /// Stopped by a signal or with nothing left to do
    Shutdown,
    /// A new image was activated; the service manager should start us again
    RestartRequested,
}

/// Wires host capabilities to the two update agents
pub struct UpdateDaemon {
    config: UpdaterConfig,
}

impl UpdateDaemon {
    /// Daemon for a validated configuration
    pub fn new(config: UpdaterConfig) -> Self {
        Self { config }
    }

    fn agents(&self, restart: Arc<dyn DeviceRestart>) -> Result<(FetchAgent, ApplyAgent)> {
        let coordinator = Coordinator::shared();
        let storage: Arc<dyn BlockStorage> =
            Arc::new(DirectoryStorage::new(&self.config.storage_root));
        let source = HttpUpdateSource::from_config(&self.config)
            .context("Failed to create update source")?;
        let flash = FilePartition::from_config(&self.config.partition);

        let fetch = FetchAgent::new(
            coordinator.clone(),
            Arc::new(source),
            storage.clone(),
            &self.config,
        );
        let apply = ApplyAgent::new(coordinator, storage, Box::new(flash), restart, &self.config);
        Ok((fetch, apply))
    }

    /// Run both agents on their schedules until a signal or a restart request
    pub async fn run(self) -> Result<DaemonExit> {
        let mut scheduler = Scheduler::new();
        let signal = scheduler.shutdown_signal();
        let restart = Arc::new(ShutdownRestart::new(signal.clone()));
        let (fetch, apply) = self.agents(restart.clone())?;

        info!(
            "Polling {} every {:?}, applying every {:?}",
            self.config.endpoint_url,
            self.config.fetch_interval(),
            self.config.apply_interval()
        );

        scheduler
            .register(Arc::new(fetch))
            .register(Arc::new(apply));
        let handle = scheduler.start();

        let signal_task = tokio::spawn(wait_for_signal(signal.clone()));
        let exits = handle.join().await;
        signal_task.abort();

        report_exits(&exits);
        Ok(exit_for(restart.restart_requested()))
    }

    /// Run a single fetch cycle followed by a single apply cycle
    pub async fn run_once(self) -> Result<DaemonExit> {
        let restart = Arc::new(ShutdownRestart::new(Scheduler::new().shutdown_signal()));
        let (fetch, apply) = self.agents(restart.clone())?;

        match fetch.run_once().await {
            Ok(outcome) => info!("Fetch: {:?}", outcome),
            Err(e) => warn!("Fetch failed ({}): {}", e.class(), e),
        }
        match apply.run_once().await {
            Ok(outcome) => info!("Apply: {:?}", outcome),
            Err(e) => warn!("Apply failed ({}): {}", e.class(), e),
        }

        Ok(exit_for(restart.restart_requested()))
    }
}

fn exit_for(restart_requested: bool) -> DaemonExit {
    if restart_requested {
        DaemonExit::RestartRequested
    } else {
        DaemonExit::Shutdown
    }
}

fn report_exits(exits: &[JobExit]) {
    for exit in exits {
        match exit.reason {
            ExitReason::Failed => error!("Job '{}' failed after {} runs", exit.name, exit.runs),
            reason => info!("Job '{}' ended ({:?}) after {} runs", exit.name, reason, exit.runs),
        }
    }
}

/// Trigger shutdown on SIGTERM, SIGINT or SIGHUP (Ctrl+C elsewhere)
async fn wait_for_signal(signal: ShutdownSignal) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal as unix_signal};

        let streams = (
            unix_signal(SignalKind::terminate()),
            unix_signal(SignalKind::interrupt()),
            unix_signal(SignalKind::hangup()),
        );
        let (mut sigterm, mut sigint, mut sighup) = match streams {
            (Ok(term), Ok(int), Ok(hup)) => (term, int, hup),
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
                error!("Failed to register signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
            _ = sighup.recv() => info!("Received SIGHUP"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error waiting for Ctrl+C: {}", e);
            return;
        }
        info!("Received Ctrl+C");
    }

    signal.trigger();
}
