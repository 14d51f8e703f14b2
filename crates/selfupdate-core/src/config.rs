//! Updater configuration
//!
//! Everything here is supplied by the environment; the agents never compute
//! endpoint, intervals or paths themselves.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// What the apply agent does when fewer bytes reached flash than the image declares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeMismatchPolicy {
    /// Log a warning and still finalize; finalize decides whether the image is usable
    #[default]
    Finalize,
    /// Fail the attempt without finalizing
    Abort,
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Reading or writing the configuration file failed
    #[error("Config I/O error for {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid configuration JSON
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: serde_json::Error,
    },

    /// A field holds a value the updater cannot run with
    #[error("Invalid configuration: {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Complete updater configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// URL of the availability/download endpoint
    pub endpoint_url: String,
    /// Version of the firmware currently running
    pub current_version: semver::Version,
    /// Seconds between fetch agent runs
    pub fetch_interval_secs: u64,
    /// Seconds between apply agent runs
    pub apply_interval_secs: u64,
    /// Path of the single staging slot on block storage
    pub staging_path: String,
    /// Storage identifier; on hosts, the directory backing block storage
    pub storage_root: PathBuf,
    /// Deadline for each network read and storage operation, in milliseconds
    pub io_timeout_ms: u64,
    /// Deadline for the availability request, in milliseconds
    pub request_timeout_ms: u64,
    /// Behavior when flash accepted fewer bytes than declared
    pub size_mismatch_policy: SizeMismatchPolicy,
    /// Reject offers that do not advertise a SHA-256 digest
    pub require_checksum: bool,
    /// Flash partition settings
    pub partition: PartitionConfig,
}

/// File-backed firmware partition settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Path of the bootable image
    pub image_path: PathBuf,
    /// Largest image the partition accepts, in bytes
    pub capacity_bytes: u64,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            image_path: PathBuf::from("/var/lib/selfupdate/firmware.bin"),
            capacity_bytes: 4 * 1024 * 1024,
        }
    }
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            endpoint_url: "http://localhost:8080/firmware.bin".to_string(),
            current_version: semver::Version::new(0, 1, 0),
            fetch_interval_secs: 3600,
            apply_interval_secs: 60,
            staging_path: "/update.bin".to_string(),
            storage_root: PathBuf::from("/var/lib/selfupdate/storage"),
            io_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            size_mismatch_policy: SizeMismatchPolicy::Finalize,
            require_checksum: false,
            partition: PartitionConfig::default(),
        }
    }
}

impl UpdaterConfig {
    /// Load configuration from `path`, writing the defaults there if it does not exist
    pub async fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        match tokio::fs::try_exists(path).await {
            Ok(true) => {}
            Ok(false) => {
                info!("Config file not found at {:?}, creating default", path);
                let config = Self::default();
                config.save_to_path(path).await?;
                return Ok(config);
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let config: UpdaterConfig =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        config.validate()?;
        debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Write configuration to `path` as pretty JSON
    pub async fn save_to_path(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let content = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        tokio::fs::write(path, content).await.map_err(io_err)?;
        debug!("Saved config to {:?}", path);
        Ok(())
    }

    /// Reject values the agents cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint_url.trim().is_empty() {
            return Err(ConfigError::invalid("endpoint_url", "must not be empty"));
        }
        if !self.endpoint_url.starts_with("http://") && !self.endpoint_url.starts_with("https://")
        {
            return Err(ConfigError::invalid(
                "endpoint_url",
                format!("unsupported scheme in {}", self.endpoint_url),
            ));
        }
        if self.fetch_interval_secs == 0 {
            return Err(ConfigError::invalid("fetch_interval_secs", "must be > 0"));
        }
        if self.apply_interval_secs == 0 {
            return Err(ConfigError::invalid("apply_interval_secs", "must be > 0"));
        }
        if !self.staging_path.starts_with('/') || self.staging_path.ends_with('/') {
            return Err(ConfigError::invalid(
                "staging_path",
                "must be an absolute file path",
            ));
        }
        if self.io_timeout_ms == 0 {
            return Err(ConfigError::invalid("io_timeout_ms", "must be > 0"));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::invalid("request_timeout_ms", "must be > 0"));
        }
        if self.partition.capacity_bytes == 0 {
            return Err(ConfigError::invalid(
                "partition.capacity_bytes",
                "must be > 0",
            ));
        }
        Ok(())
    }

    /// Interval between fetch agent runs
    pub fn fetch_interval(&self) -> Duration {
        Duration::from_secs(self.fetch_interval_secs)
    }

    /// Interval between apply agent runs
    pub fn apply_interval(&self) -> Duration {
        Duration::from_secs(self.apply_interval_secs)
    }

    /// Deadline for a single network read or storage operation
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// Deadline for the availability request
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
