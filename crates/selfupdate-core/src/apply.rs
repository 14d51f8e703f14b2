//! Apply agent: flashes a staged image and restarts into it
//!
//! ```text
//! Idle -> CheckingStage -> NoImage -> Idle
//!                       -> ImageFound -> Flashing -> Rebooting        (success)
//!                                                 -> Idle, discarded  (failure)
//! ```
//!
//! The staged image is deleted after every attempt that found one, whatever
//! the result, so a bad image is never retried forever. Deletion happens
//! before the restart because a real restart does not return.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::capability::{BlockStorage, DeviceRestart, FirmwareFlash, StagedReader};
use crate::config::{SizeMismatchPolicy, UpdaterConfig};
use crate::coordinator::Coordinator;
use crate::error::{FlashError, FlashErrorCode, Result, UpdateError};
use crate::scheduler::{JobControl, PeriodicJob};
use crate::staging::{StagingSlot, with_deadline};

/// Size of each read from the staged image into flash
pub const FLASH_CHUNK_SIZE: usize = 4096;

/// Where the apply agent is in its state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyPhase {
    /// Waiting for the next tick
    Idle,
    /// Looking for a staged image
    CheckingStage,
    /// A staged image was opened
    ImageFound,
    /// Writing the image into the firmware partition
    Flashing,
    /// Restart requested; terminal for this process
    Rebooting,
}

/// What a single apply cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The coordinator gate was held by the other agent
    Deferred,
    /// Nothing staged
    NoImage,
    /// The image was flashed and verified; restart has been requested
    Restarting,
}

/// Periodic task that consumes the staged image
pub struct ApplyAgent {
    coordinator: Arc<Coordinator>,
    storage: Arc<dyn BlockStorage>,
    flash: tokio::sync::Mutex<Box<dyn FirmwareFlash>>,
    restart: Arc<dyn DeviceRestart>,
    slot: StagingSlot,
    period: Duration,
    io_timeout: Duration,
    size_mismatch_policy: SizeMismatchPolicy,
    phase: Mutex<ApplyPhase>,
}

impl ApplyAgent {
    /// Build an apply agent from the shared coordinator, its capabilities and configuration
    pub fn new(
        coordinator: Arc<Coordinator>,
        storage: Arc<dyn BlockStorage>,
        flash: Box<dyn FirmwareFlash>,
        restart: Arc<dyn DeviceRestart>,
        config: &UpdaterConfig,
    ) -> Self {
        Self {
            coordinator,
            storage,
            flash: tokio::sync::Mutex::new(flash),
            restart,
            slot: StagingSlot::new(config.staging_path.clone()),
            period: config.apply_interval(),
            io_timeout: config.io_timeout(),
            size_mismatch_policy: config.size_mismatch_policy,
            phase: Mutex::new(ApplyPhase::Idle),
        }
    }

    /// Current state machine phase
    pub fn phase(&self) -> ApplyPhase {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: ApplyPhase) {
        *self.phase.lock() = phase;
    }

    /// Run one check of the staging slot, flashing and restarting when an image is present.
    pub async fn run_once(&self) -> Result<ApplyOutcome> {
        if self.phase() == ApplyPhase::Rebooting {
            return Ok(ApplyOutcome::Restarting);
        }

        let Some(_gate) = self.coordinator.try_enter_apply() else {
            debug!(
                "Apply deferred: update gate is {}",
                self.coordinator.state()
            );
            return Ok(ApplyOutcome::Deferred);
        };

        self.set_phase(ApplyPhase::CheckingStage);
        let result = self.check_and_apply().await;
        if !matches!(result, Ok(ApplyOutcome::Restarting)) {
            self.set_phase(ApplyPhase::Idle);
        }
        result
    }

    async fn check_and_apply(&self) -> Result<ApplyOutcome> {
        with_deadline("storage mount", self.io_timeout, self.storage.mount()).await?;

        let opened = with_deadline(
            "staged image open",
            self.io_timeout,
            self.storage.open(self.slot.path()),
        )
        .await?;

        let Some(mut reader) = opened else {
            debug!("No staged update at {}", self.slot.path());
            return Ok(ApplyOutcome::NoImage);
        };

        self.set_phase(ApplyPhase::ImageFound);
        let size = reader.size();
        info!("Staged update found: {} bytes", size);

        let flashed = self.flash_image(reader.as_mut(), size).await;
        self.cleanup(reader).await;

        match flashed {
            Ok(written) => {
                info!("Update flashed and verified ({} bytes), restarting", written);
                self.set_phase(ApplyPhase::Rebooting);
                self.restart.restart();
                Ok(ApplyOutcome::Restarting)
            }
            Err(e) => {
                warn!("Staged image {} discarded after failed update", self.slot.path());
                Err(e)
            }
        }
    }

    async fn flash_image(&self, reader: &mut dyn StagedReader, size: u64) -> Result<u64> {
        if size == 0 {
            return Err(UpdateError::CorruptImage(
                "staged image is empty".to_string(),
            ));
        }

        let mut flash = self.flash.lock().await;
        self.set_phase(ApplyPhase::Flashing);

        flash.begin(size).await.map_err(|e| match e {
            FlashError::InsufficientSpace { .. } => UpdateError::Capacity(e),
            e if e.code() == FlashErrorCode::SPACE => UpdateError::Capacity(e),
            e => UpdateError::Flash(e),
        })?;
        info!("Flash update started: {} bytes", size);

        let written = self.stream_into_flash(reader, &mut **flash).await?;

        if written != size {
            match self.size_mismatch_policy {
                SizeMismatchPolicy::Finalize => warn!(
                    "Flash accepted {} of {} bytes, finalizing anyway",
                    written, size
                ),
                SizeMismatchPolicy::Abort => {
                    return Err(UpdateError::SizeMismatch {
                        declared: size,
                        written,
                    });
                }
            }
        }

        if let Err(e) = flash.end().await {
            return Err(UpdateError::FinalizeFailed {
                code: e.code(),
                reason: e.to_string(),
            });
        }

        if !flash.is_finished() {
            return Err(UpdateError::FinalizeFailed {
                code: flash.last_error(),
                reason: "finalize succeeded but the update is not verified complete".to_string(),
            });
        }

        Ok(written)
    }

    /// Copy the staged image into flash, returning how many bytes flash accepted.
    ///
    /// A flash write failure ends the copy early and shows up as a short count.
    async fn stream_into_flash(
        &self,
        reader: &mut dyn StagedReader,
        flash: &mut dyn FirmwareFlash,
    ) -> Result<u64> {
        let mut buf = vec![0u8; FLASH_CHUNK_SIZE];
        let mut written = 0u64;

        loop {
            let read = with_deadline(
                "staged image read",
                self.io_timeout,
                reader.read(&mut buf),
            )
            .await?;
            let Some(chunk) = buf.get(..read).filter(|c| !c.is_empty()) else {
                break;
            };

            let accepted = with_deadline("flash write", self.io_timeout, async {
                flash.write(chunk).await.map_err(UpdateError::Flash)
            })
            .await;

            match accepted {
                Ok(accepted) => {
                    written += accepted as u64;
                    if accepted < chunk.len() {
                        warn!(
                            "Flash accepted {} of {} bytes at offset {}",
                            accepted,
                            chunk.len(),
                            written
                        );
                        break;
                    }
                }
                Err(UpdateError::Flash(e)) => {
                    warn!(
                        "Flash write failed at offset {} (code {}): {}",
                        written,
                        e.code(),
                        e
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(written)
    }

    async fn cleanup(&self, reader: Box<dyn StagedReader>) {
        if let Err(e) = with_deadline("staged image close", self.io_timeout, reader.close()).await
        {
            warn!("Failed to close staged image: {}", e);
        }

        match with_deadline(
            "staged image remove",
            self.io_timeout,
            self.storage.remove(self.slot.path()),
        )
        .await
        {
            Ok(()) => debug!("Removed staged image {}", self.slot.path()),
            Err(e) => warn!("Failed to remove staged image {}: {}", self.slot.path(), e),
        }
    }
}

#[async_trait]
impl PeriodicJob for ApplyAgent {
    fn name(&self) -> &str {
        "apply"
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn run(&self) -> JobControl {
        match self.run_once().await {
            Ok(ApplyOutcome::Restarting) => JobControl::Stop,
            Ok(outcome) => {
                debug!("Apply cycle finished: {:?}", outcome);
                JobControl::Continue
            }
            Err(e) => {
                match e.flash_code() {
                    Some(code) => error!(
                        "Apply cycle failed ({}, flash error {}), retrying next tick: {}",
                        e.class(),
                        code,
                        e
                    ),
                    None => error!(
                        "Apply cycle failed ({}), retrying next tick: {}",
                        e.class(),
                        e
                    ),
                }
                JobControl::Continue
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::StagingWriter;
    use tracing_test::traced_test;

    struct UnmountableStorage;

    #[async_trait]
    impl BlockStorage for UnmountableStorage {
        async fn mount(&self) -> Result<()> {
            Err(UpdateError::StorageMount("card not present".to_string()))
        }

        async fn create(&self, path: &str) -> Result<Box<dyn StagingWriter>> {
            Err(UpdateError::storage(
                format!("create {path}"),
                std::io::Error::from(std::io::ErrorKind::Unsupported),
            ))
        }

        async fn open(&self, _path: &str) -> Result<Option<Box<dyn StagedReader>>> {
            Ok(None)
        }

        async fn rename(&self, _from: &str, _to: &str) -> Result<()> {
            Ok(())
        }

        async fn remove(&self, _path: &str) -> Result<()> {
            Ok(())
        }
    }

    struct IdleFlash;

    #[async_trait]
    impl FirmwareFlash for IdleFlash {
        async fn begin(&mut self, _size: u64) -> std::result::Result<(), FlashError> {
            Ok(())
        }

        async fn write(&mut self, data: &[u8]) -> std::result::Result<usize, FlashError> {
            Ok(data.len())
        }

        async fn end(&mut self) -> std::result::Result<(), FlashError> {
            Ok(())
        }

        fn is_finished(&self) -> bool {
            true
        }

        fn last_error(&self) -> FlashErrorCode {
            FlashErrorCode::NONE
        }
    }

    struct NoRestart;

    impl DeviceRestart for NoRestart {
        fn restart(&self) {}
    }

    #[tokio::test]
    #[traced_test]
    async fn test_mount_failure_is_logged_with_its_cause() {
        let coordinator = Coordinator::shared();
        let agent = ApplyAgent::new(
            coordinator.clone(),
            Arc::new(UnmountableStorage),
            Box::new(IdleFlash),
            Arc::new(NoRestart),
            &UpdaterConfig::default(),
        );

        assert_eq!(agent.run().await, JobControl::Continue);
        assert!(logs_contain("Apply cycle failed (transient)"));
        assert!(logs_contain("card not present"));
        assert!(coordinator.is_idle());
        assert_eq!(agent.phase(), ApplyPhase::Idle);
    }
}
