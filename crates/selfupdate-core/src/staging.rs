//! The single staging slot and deadline-bounded I/O helpers

use std::future::Future;
use std::time::Duration;

use crate::error::{Result, UpdateError};

/// Size of each write into the staging slot
pub const STAGING_CHUNK_SIZE: usize = 1024;

/// Suffix of the in-progress download file
const PARTIAL_SUFFIX: &str = ".part";

/// Location of the single staged image on block storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingSlot {
    path: String,
    partial_path: String,
}

impl StagingSlot {
    /// Slot at `path`; the download is written beside it until complete
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let partial_path = format!("{path}{PARTIAL_SUFFIX}");
        Self { path, partial_path }
    }

    /// Path the apply agent consumes
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path the fetch agent writes while a download is in flight
    pub fn partial_path(&self) -> &str {
        &self.partial_path
    }
}

/// A downloaded-but-not-yet-applied firmware candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedImage {
    /// Storage path
    pub path: String,
    /// Byte length
    pub size: u64,
    /// Length the endpoint declared, if it declared one
    pub declared_size: Option<u64>,
}

impl StagedImage {
    /// Fully written: matches the declared length, or no length was declared
    pub fn is_complete(&self) -> bool {
        self.declared_size.is_none_or(|declared| declared == self.size)
    }
}

/// Run `fut`, failing with [`UpdateError::Timeout`] once `timeout` elapses.
pub async fn with_deadline<T, F>(operation: &'static str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(UpdateError::Timeout { operation, timeout }),
    }
}
