//! Fetch agent: polls the update endpoint and stages new images
//!
//! A download is written to the slot's partial path in fixed
//! [`STAGING_CHUNK_SIZE`] blocks and promoted to the staging path only after
//! the body is exhausted and passes the length and digest checks, so the apply
//! agent never sees a half-written image.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::capability::{
    BlockStorage, ImageBody, StagingWriter, UpdateCheck, UpdateOffer, UpdateSource,
};
use crate::config::UpdaterConfig;
use crate::coordinator::Coordinator;
use crate::error::{Result, UpdateError};
use crate::scheduler::{JobControl, PeriodicJob};
use crate::staging::{STAGING_CHUNK_SIZE, StagedImage, StagingSlot, with_deadline};

/// What a single fetch cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The coordinator gate was held by the other agent
    Deferred,
    /// The endpoint reported the running firmware as current
    UpToDate,
    /// The endpoint answered with an unexpected status; retried next tick
    Skipped {
        /// Status returned by the endpoint
        status: u16,
    },
    /// A new image is in the staging slot
    Staged(StagedImage),
}

/// Periodic task that downloads new firmware into the staging slot
pub struct FetchAgent {
    coordinator: Arc<Coordinator>,
    source: Arc<dyn UpdateSource>,
    storage: Arc<dyn BlockStorage>,
    slot: StagingSlot,
    current_version: semver::Version,
    period: Duration,
    io_timeout: Duration,
    request_timeout: Duration,
    require_checksum: bool,
}

impl FetchAgent {
    /// Build a fetch agent from the shared coordinator, its capabilities and configuration
    pub fn new(
        coordinator: Arc<Coordinator>,
        source: Arc<dyn UpdateSource>,
        storage: Arc<dyn BlockStorage>,
        config: &UpdaterConfig,
    ) -> Self {
        Self {
            coordinator,
            source,
            storage,
            slot: StagingSlot::new(config.staging_path.clone()),
            current_version: config.current_version.clone(),
            period: config.fetch_interval(),
            io_timeout: config.io_timeout(),
            request_timeout: config.request_timeout(),
            require_checksum: config.require_checksum,
        }
    }

    /// Staging slot this agent writes
    pub fn slot(&self) -> &StagingSlot {
        &self.slot
    }

    /// Run one poll: check availability and, when an update is offered, stage it.
    pub async fn run_once(&self) -> Result<FetchOutcome> {
        let Some(_gate) = self.coordinator.try_enter_download() else {
            debug!(
                "Fetch deferred: update gate is {}",
                self.coordinator.state()
            );
            return Ok(FetchOutcome::Deferred);
        };

        let check = with_deadline(
            "availability request",
            self.request_timeout,
            self.source.check_update(&self.current_version),
        )
        .await?;

        let offer = match check {
            UpdateCheck::UpToDate => {
                info!("Firmware {} is up to date", self.current_version);
                return Ok(FetchOutcome::UpToDate);
            }
            UpdateCheck::Unexpected(status) => {
                warn!("Update endpoint returned unexpected status {}", status);
                return Ok(FetchOutcome::Skipped { status });
            }
            UpdateCheck::Available(offer) => offer,
        };

        if self.require_checksum && offer.sha256.is_none() {
            return Err(UpdateError::ChecksumMissing);
        }

        match offer.content_length {
            Some(len) => info!("Update available ({} bytes), downloading", len),
            None => info!("Update available (unknown length), downloading"),
        }

        let image = self.stage(offer).await?;
        info!("Staged update image: {} bytes at {}", image.size, image.path);
        Ok(FetchOutcome::Staged(image))
    }

    async fn stage(&self, offer: UpdateOffer) -> Result<StagedImage> {
        let UpdateOffer {
            content_length,
            sha256,
            mut body,
        } = offer;

        with_deadline("storage mount", self.io_timeout, self.storage.mount()).await?;

        let mut writer = with_deadline(
            "staging open",
            self.io_timeout,
            self.storage.create(self.slot.partial_path()),
        )
        .await?;

        let copied = self.copy_body(body.as_mut(), writer.as_mut()).await;
        let closed = with_deadline("staging close", self.io_timeout, writer.close()).await;

        let verified = match (copied, closed) {
            (Ok((written, digest)), Ok(())) => {
                let image = StagedImage {
                    path: self.slot.path().to_string(),
                    size: written,
                    declared_size: content_length,
                };
                Self::verify(&image, &digest, sha256.as_deref()).map(|()| image)
            }
            (Err(e), _) | (Ok(_), Err(e)) => Err(e),
        };

        let image = match verified {
            Ok(image) => image,
            Err(e) => {
                self.discard_partial().await;
                return Err(e);
            }
        };

        if let Err(e) = with_deadline(
            "staging promote",
            self.io_timeout,
            self.storage
                .rename(self.slot.partial_path(), self.slot.path()),
        )
        .await
        {
            self.discard_partial().await;
            return Err(e);
        }

        Ok(image)
    }

    /// Copy the body into the writer in fixed-size blocks, returning bytes written and digest.
    async fn copy_body(
        &self,
        body: &mut dyn ImageBody,
        writer: &mut dyn StagingWriter,
    ) -> Result<(u64, String)> {
        let mut hasher = Sha256::new();
        let mut pending = BytesMut::with_capacity(STAGING_CHUNK_SIZE * 2);
        let mut written = 0u64;

        while let Some(chunk) =
            with_deadline("network read", self.io_timeout, body.next_chunk()).await?
        {
            hasher.update(&chunk);
            pending.extend_from_slice(&chunk);

            while pending.len() >= STAGING_CHUNK_SIZE {
                let block = pending.split_to(STAGING_CHUNK_SIZE);
                with_deadline("staging write", self.io_timeout, writer.write(&block)).await?;
                written += block.len() as u64;
            }
        }

        if !pending.is_empty() {
            with_deadline("staging write", self.io_timeout, writer.write(&pending)).await?;
            written += pending.len() as u64;
        }

        Ok((written, hex::encode(hasher.finalize())))
    }

    fn verify(image: &StagedImage, digest: &str, expected_sha256: Option<&str>) -> Result<()> {
        if !image.is_complete() {
            return Err(UpdateError::Truncated {
                expected: image.declared_size.unwrap_or_default(),
                received: image.size,
            });
        }

        if let Some(expected) = expected_sha256
            && !expected.eq_ignore_ascii_case(digest)
        {
            return Err(UpdateError::ChecksumMismatch {
                expected: expected.to_string(),
                actual: digest.to_string(),
            });
        }

        Ok(())
    }

    async fn discard_partial(&self) {
        let removed = with_deadline(
            "staging discard",
            self.io_timeout,
            self.storage.remove(self.slot.partial_path()),
        )
        .await;
        if let Err(e) = removed {
            warn!(
                "Failed to remove partial download {}: {}",
                self.slot.partial_path(),
                e
            );
        }
    }
}

#[async_trait]
impl PeriodicJob for FetchAgent {
    fn name(&self) -> &str {
        "fetch"
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn run(&self) -> JobControl {
        match self.run_once().await {
            Ok(outcome) => debug!("Fetch cycle finished: {:?}", outcome),
            Err(e) => error!(
                "Fetch cycle failed ({}), retrying next poll: {}",
                e.class(),
                e
            ),
        }
        JobControl::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(size: u64, declared_size: Option<u64>) -> StagedImage {
        StagedImage {
            path: "/update.bin".to_string(),
            size,
            declared_size,
        }
    }

    #[test]
    fn test_verify_accepts_matching_length_and_digest() {
        let digest = hex::encode(Sha256::digest(b"firmware"));
        assert!(FetchAgent::verify(&image(8, Some(8)), &digest, Some(&digest)).is_ok());
        assert!(FetchAgent::verify(&image(8, None), &digest, None).is_ok());
    }

    #[test]
    fn test_verify_rejects_short_download() {
        let result = FetchAgent::verify(&image(50, Some(100)), "", None);
        assert!(matches!(
            result,
            Err(UpdateError::Truncated {
                expected: 100,
                received: 50
            })
        ));
    }

    #[test]
    fn test_verify_digest_is_case_insensitive() {
        let digest = hex::encode(Sha256::digest(b"firmware"));
        let upper = digest.to_ascii_uppercase();
        assert!(FetchAgent::verify(&image(8, None), &digest, Some(&upper)).is_ok());
        assert!(matches!(
            FetchAgent::verify(&image(8, None), &digest, Some("00")),
            Err(UpdateError::ChecksumMismatch { .. })
        ));
    }
}
