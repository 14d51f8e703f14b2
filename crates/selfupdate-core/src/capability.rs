//! Capabilities the update core consumes from the host environment
//!
//! The core never talks to a transport, a filesystem or flash hardware
//! directly. Each collaborator is reached through one of the traits below;
//! [`crate::host`] provides implementations for Linux-class hosts and tests
//! provide in-memory ones.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{FlashError, FlashErrorCode, Result};

/// Answer to an availability request
pub enum UpdateCheck {
    /// The running firmware is current
    UpToDate,
    /// A newer image is available; its body can be streamed
    Available(UpdateOffer),
    /// The endpoint answered with a status the agent does not understand
    Unexpected(u16),
}

impl std::fmt::Debug for UpdateCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateCheck::UpToDate => write!(f, "UpToDate"),
            UpdateCheck::Available(offer) => f
                .debug_struct("Available")
                .field("content_length", &offer.content_length)
                .field("sha256", &offer.sha256)
                .finish_non_exhaustive(),
            UpdateCheck::Unexpected(status) => write!(f, "Unexpected({status})"),
        }
    }
}

/// A newer image offered by the update endpoint
pub struct UpdateOffer {
    /// Length the endpoint declared for the image, if any
    pub content_length: Option<u64>,
    /// Hex-encoded SHA-256 digest the endpoint advertised, if any
    pub sha256: Option<String>,
    /// Image bytes
    pub body: Box<dyn ImageBody>,
}

/// Streaming body of an offered image
#[async_trait]
pub trait ImageBody: Send {
    /// Next chunk of the image, or `None` once the source is exhausted
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

/// Network capability: asks the endpoint whether a newer image exists
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Issue an availability request for the given running version
    async fn check_update(&self, current_version: &semver::Version) -> Result<UpdateCheck>;
}

/// Storage capability: the block device holding the staging slot
#[async_trait]
pub trait BlockStorage: Send + Sync {
    /// Initialize/mount the storage; called before every access
    async fn mount(&self) -> Result<()>;

    /// Open `path` for writing, truncating prior content
    async fn create(&self, path: &str) -> Result<Box<dyn StagingWriter>>;

    /// Open `path` for reading; `None` when it does not exist
    async fn open(&self, path: &str) -> Result<Option<Box<dyn StagedReader>>>;

    /// Atomically replace `to` with `from`
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Delete `path`; deleting a missing file is not an error
    async fn remove(&self, path: &str) -> Result<()>;
}

/// Write handle on the staging slot
#[async_trait]
pub trait StagingWriter: Send {
    /// Append bytes
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Flush and close the handle
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Read handle on a staged image
#[async_trait]
pub trait StagedReader: Send {
    /// Size of the image in bytes
    fn size(&self) -> u64;

    /// Read into `buf`, returning 0 at end of file
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Close the handle
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Flash-write capability for the firmware partition
#[async_trait]
pub trait FirmwareFlash: Send {
    /// Prepare to write an image of `size` bytes
    async fn begin(&mut self, size: u64) -> std::result::Result<(), FlashError>;

    /// Write the next slice of the image, returning how many bytes were accepted
    async fn write(&mut self, data: &[u8]) -> std::result::Result<usize, FlashError>;

    /// Close out the write sequence
    async fn end(&mut self) -> std::result::Result<(), FlashError>;

    /// Whether the last sequence is complete and verified
    fn is_finished(&self) -> bool;

    /// Last error code reported by the primitive
    fn last_error(&self) -> FlashErrorCode;
}

/// Restart capability
pub trait DeviceRestart: Send + Sync {
    /// Restart into the newly flashed image. On a device this does not return.
    fn restart(&self);
}
