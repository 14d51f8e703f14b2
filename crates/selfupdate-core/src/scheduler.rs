//! Periodic job scheduler
//!
//! Each registered job gets its own task that runs the job, then waits for
//! the job's period, until shutdown or until the job asks to stop. Time comes
//! from tokio, so tests drive the schedule with a paused clock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info};

/// Whether a job wants to keep being scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobControl {
    /// Run again after the next period
    Continue,
    /// Never run again
    Stop,
}

/// Work executed on a fixed period
#[async_trait]
pub trait PeriodicJob: Send + Sync {
    /// Name used in logs and exit reports
    fn name(&self) -> &str;

    /// Delay between the start of consecutive runs
    fn period(&self) -> Duration;

    /// Run one iteration
    async fn run(&self) -> JobControl;
}

/// Why a job task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Shutdown was signalled
    Shutdown,
    /// The job returned [`JobControl::Stop`]
    Stopped,
    /// The job task panicked or was aborted
    Failed,
}

/// Summary of a finished job task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobExit {
    /// Job name
    pub name: String,
    /// Completed iterations
    pub runs: u64,
    /// Why the task ended
    pub reason: ExitReason,
}

/// Cloneable trigger that stops every job of one scheduler
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Ask all jobs to stop after their current iteration
    pub fn trigger(&self) {
        self.tx.send_replace(true);
        debug!("Shutdown signalled");
    }

    /// Whether shutdown has been triggered
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until shutdown is triggered
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            let stopped = *rx.borrow_and_update();
            if stopped || rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Collects periodic jobs and starts them on the tokio runtime
pub struct Scheduler {
    jobs: Vec<Arc<dyn PeriodicJob>>,
    shutdown: ShutdownSignal,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self {
            jobs: Vec::new(),
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Register a job; jobs start in registration order
    pub fn register(&mut self, job: Arc<dyn PeriodicJob>) -> &mut Self {
        debug!("Registered job '{}' every {:?}", job.name(), job.period());
        self.jobs.push(job);
        self
    }

    /// Number of registered jobs
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Signal that stops every job started by this scheduler
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Spawn one task per job
    pub fn start(self) -> SchedulerHandle {
        let tasks = self
            .jobs
            .into_iter()
            .map(|job| {
                let name = job.name().to_string();
                let rx = self.shutdown.subscribe();
                let handle = tokio::spawn(run_job(job, rx));
                (name, handle)
            })
            .collect();

        SchedulerHandle {
            tasks,
            shutdown: self.shutdown,
        }
    }
}

async fn run_job(job: Arc<dyn PeriodicJob>, mut shutdown_rx: watch::Receiver<bool>) -> JobExit {
    let name = job.name().to_string();
    let mut ticker = interval(job.period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut runs = 0u64;

    info!("Job '{}' started (period {:?})", name, job.period());

    loop {
        let stopped = *shutdown_rx.borrow_and_update();
        if stopped {
            info!("Job '{}' stopping on shutdown after {} runs", name, runs);
            return JobExit {
                name,
                runs,
                reason: ExitReason::Shutdown,
            };
        }

        tokio::select! {
            // A change can only be the trigger; a closed channel means the
            // scheduler handle and every signal were dropped.
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    info!("Job '{}' stopping: scheduler dropped", name);
                    return JobExit { name, runs, reason: ExitReason::Shutdown };
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        let control = job.run().await;
        runs += 1;

        if control == JobControl::Stop {
            info!("Job '{}' finished after {} runs", name, runs);
            return JobExit {
                name,
                runs,
                reason: ExitReason::Stopped,
            };
        }
    }
}

/// Running scheduler
pub struct SchedulerHandle {
    tasks: Vec<(String, JoinHandle<JobExit>)>,
    shutdown: ShutdownSignal,
}

impl SchedulerHandle {
    /// Signal that stops every job
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Ask every job to stop after its current iteration
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Wait for every job task to end
    pub async fn join(self) -> Vec<JobExit> {
        let mut exits = Vec::with_capacity(self.tasks.len());
        for (name, handle) in self.tasks {
            match handle.await {
                Ok(exit) => exits.push(exit),
                Err(e) => {
                    error!("Job '{}' task failed: {}", name, e);
                    exits.push(JobExit {
                        name,
                        runs: 0,
                        reason: ExitReason::Failed,
                    });
                }
            }
        }
        exits
    }
}
