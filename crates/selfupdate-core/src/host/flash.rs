//! File-backed firmware partition

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::capability::FirmwareFlash;
use crate::config::PartitionConfig;
use crate::error::{FlashError, FlashErrorCode};

type FlashResult<T> = std::result::Result<T, FlashError>;

/// Firmware partition backed by a single image file
///
/// Writes go to an inactive copy beside the image. A successful `end()` checks
/// the byte count and atomically replaces the bootable image, so a failed
/// update leaves the previous image in place.
pub struct FilePartition {
    image_path: PathBuf,
    inactive_path: PathBuf,
    capacity: u64,
    session: Option<Session>,
    finished: bool,
    last_error: FlashErrorCode,
}

struct Session {
    file: File,
    expected: u64,
    written: u64,
}

impl FilePartition {
    /// Partition at `image_path` holding at most `capacity` bytes
    pub fn new(image_path: impl Into<PathBuf>, capacity: u64) -> Self {
        let image_path = image_path.into();
        let mut inactive: OsString = image_path.as_os_str().to_owned();
        inactive.push(".new");

        Self {
            image_path,
            inactive_path: PathBuf::from(inactive),
            capacity,
            session: None,
            finished: false,
            last_error: FlashErrorCode::NONE,
        }
    }

    /// Partition described by the configuration
    pub fn from_config(config: &PartitionConfig) -> Self {
        Self::new(config.image_path.clone(), config.capacity_bytes)
    }

    /// Path of the bootable image
    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    fn fail(&mut self, code: FlashErrorCode, message: impl Into<String>) -> FlashError {
        self.last_error = code;
        FlashError::primitive(code, message)
    }

    async fn discard_inactive(&self) {
        if let Err(e) = fs::remove_file(&self.inactive_path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("Failed to remove {:?}: {}", self.inactive_path, e);
        }
    }
}

#[async_trait]
impl FirmwareFlash for FilePartition {
    async fn begin(&mut self, size: u64) -> FlashResult<()> {
        self.finished = false;
        if self.session.take().is_some() {
            warn!("Previous flash session abandoned");
        }

        if size > self.capacity {
            self.last_error = FlashErrorCode::SPACE;
            return Err(FlashError::InsufficientSpace {
                requested: size,
                available: self.capacity,
            });
        }
        if size == 0 {
            return Err(self.fail(FlashErrorCode::SIZE, "image size is zero"));
        }

        if let Some(parent) = self.inactive_path.parent()
            && let Err(e) = fs::create_dir_all(parent).await
        {
            let message = format!("prepare {parent:?}: {e}");
            return Err(self.fail(FlashErrorCode::ERASE, message));
        }

        let file = match File::create(&self.inactive_path).await {
            Ok(file) => file,
            Err(e) => {
                let path = self.inactive_path.clone();
                return Err(self.fail(FlashErrorCode::ERASE, format!("erase {path:?}: {e}")));
            }
        };

        debug!("Flash session started: {} bytes into {:?}", size, self.inactive_path);
        self.session = Some(Session {
            file,
            expected: size,
            written: 0,
        });
        self.last_error = FlashErrorCode::NONE;
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> FlashResult<usize> {
        let Some(session) = self.session.as_mut() else {
            return Err(self.fail(FlashErrorCode::NOT_STARTED, "write without begin"));
        };

        let remaining = session.expected - session.written;
        let accept = data.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));

        if let Err(e) = session.file.write_all(&data[..accept]).await {
            return Err(self.fail(FlashErrorCode::WRITE, e.to_string()));
        }
        session.written += accept as u64;
        Ok(accept)
    }

    async fn end(&mut self) -> FlashResult<()> {
        let Some(mut session) = self.session.take() else {
            return Err(self.fail(FlashErrorCode::NOT_STARTED, "end without begin"));
        };

        if session.written != session.expected {
            drop(session);
            self.discard_inactive().await;
            return Err(self.fail(
                FlashErrorCode::SIZE,
                "image incomplete, previous image kept",
            ));
        }

        let synced = match session.file.flush().await {
            Ok(()) => session.file.sync_all().await,
            Err(e) => Err(e),
        };
        drop(session);
        if let Err(e) = synced {
            self.discard_inactive().await;
            return Err(self.fail(FlashErrorCode::VERIFY, e.to_string()));
        }

        if let Err(e) = fs::rename(&self.inactive_path, &self.image_path).await {
            self.discard_inactive().await;
            return Err(self.fail(FlashErrorCode::ACTIVATE, e.to_string()));
        }

        info!("Activated new firmware image {:?}", self.image_path);
        self.finished = true;
        self.last_error = FlashErrorCode::NONE;
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn last_error(&self) -> FlashErrorCode {
        self.last_error
    }
}
