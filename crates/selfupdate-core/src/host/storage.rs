//! Directory-backed block storage

use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::debug;

use crate::capability::{BlockStorage, StagedReader, StagingWriter};
use crate::error::{Result, UpdateError};

/// Block storage rooted at a host directory
///
/// Storage paths are absolute (`/update.bin`) and resolve beneath the root.
/// Paths that would escape the root are rejected.
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    root: PathBuf,
}

impl DirectoryStorage {
    /// Storage rooted at `root`; nothing is touched until [`BlockStorage::mount`]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Host directory backing the storage
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));

        if relative.as_os_str().is_empty() || escapes {
            return Err(UpdateError::storage(
                format!("resolve {path}"),
                io::Error::new(io::ErrorKind::InvalidInput, "path escapes storage root"),
            ));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlockStorage for DirectoryStorage {
    async fn mount(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await.map_err(|e| {
            UpdateError::StorageMount(format!("{}: {}", self.root.display(), e))
        })?;

        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            UpdateError::StorageMount(format!("{}: {}", self.root.display(), e))
        })?;
        if !metadata.is_dir() {
            return Err(UpdateError::StorageMount(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        Ok(())
    }

    async fn create(&self, path: &str) -> Result<Box<dyn StagingWriter>> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| UpdateError::storage(format!("create parent of {path}"), e))?;
        }

        let file = File::create(&full)
            .await
            .map_err(|e| UpdateError::storage(format!("create {path}"), e))?;
        debug!("Opened {:?} for writing", full);

        Ok(Box::new(FileWriter {
            path: path.to_string(),
            file: BufWriter::new(file),
        }))
    }

    async fn open(&self, path: &str) -> Result<Option<Box<dyn StagedReader>>> {
        let full = self.resolve(path)?;
        let file = match File::open(&full).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(UpdateError::storage(format!("open {path}"), e)),
        };

        let size = file
            .metadata()
            .await
            .map_err(|e| UpdateError::storage(format!("stat {path}"), e))?
            .len();

        Ok(Some(Box::new(FileReader {
            path: path.to_string(),
            file,
            size,
        })))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        fs::rename(&source, &target)
            .await
            .map_err(|e| UpdateError::storage(format!("rename {from} to {to}"), e))
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        match fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(UpdateError::storage(format!("remove {path}"), e)),
        }
    }
}

struct FileWriter {
    path: String,
    file: BufWriter<File>,
}

#[async_trait]
impl StagingWriter for FileWriter {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file
            .write_all(data)
            .await
            .map_err(|e| UpdateError::storage(format!("write {}", self.path), e))
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        self.file
            .flush()
            .await
            .map_err(|e| UpdateError::storage(format!("flush {}", self.path), e))?;
        self.file
            .get_mut()
            .sync_all()
            .await
            .map_err(|e| UpdateError::storage(format!("sync {}", self.path), e))
    }
}

struct FileReader {
    path: String,
    file: File,
    size: u64,
}

#[async_trait]
impl StagedReader for FileReader {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.file
            .read(buf)
            .await
            .map_err(|e| UpdateError::storage(format!("read {}", self.path), e))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
