//! Firmware self-update coordination
//!
//! Two periodic agents keep a device's firmware current:
//!
//! - the fetch agent asks an update endpoint whether a newer image exists and
//!   streams it into a single staging slot on block storage;
//! - the apply agent flashes a staged image into the firmware partition,
//!   deletes the staged copy and restarts the device.
//!
//! A shared [`Coordinator`] guarantees that a download and a flash never run
//! at the same time, so the apply agent never reads a half-written image.
//!
//! # Architecture
//!
//! - [`coordinator`]: atomic update gate
//! - [`fetch`]: fetch agent
//! - [`apply`]: apply agent
//! - [`staging`]: staging slot and deadline-bounded I/O
//! - [`scheduler`]: periodic job scheduler
//! - [`capability`]: traits for network, storage, flash and restart
//! - [`host`]: capability implementations for Linux-class hosts
//! - [`config`]: updater configuration
//! - [`error`]: error types
//!
//! # Example
//!
//! ```ignore
//! use selfupdate_core::prelude::*;
//!
//! # async fn example(config: UpdaterConfig, flash: Box<dyn FirmwareFlash>) -> anyhow::Result<()> {
//! let coordinator = Coordinator::shared();
//! let storage = Arc::new(DirectoryStorage::new(&config.storage_root));
//! let source = Arc::new(HttpUpdateSource::from_config(&config)?);
//!
//! let mut scheduler = Scheduler::new();
//! let restart = Arc::new(ShutdownRestart::new(scheduler.shutdown_signal()));
//!
//! scheduler
//!     .register(Arc::new(FetchAgent::new(coordinator.clone(), source, storage.clone(), &config)))
//!     .register(Arc::new(ApplyAgent::new(coordinator, storage, flash, restart, &config)));
//!
//! let exits = scheduler.start().join().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod apply;
pub mod capability;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetch;
pub mod host;
pub mod prelude;
pub mod scheduler;
pub mod staging;

pub use apply::{ApplyAgent, ApplyOutcome, ApplyPhase, FLASH_CHUNK_SIZE};
pub use capability::{
    BlockStorage, DeviceRestart, FirmwareFlash, ImageBody, StagedReader, StagingWriter,
    UpdateCheck, UpdateOffer, UpdateSource,
};
pub use config::{ConfigError, PartitionConfig, SizeMismatchPolicy, UpdaterConfig};
pub use coordinator::{Coordinator, GateGuard, GateState};
pub use error::{ErrorClass, FlashError, FlashErrorCode, UpdateError};
pub use fetch::{FetchAgent, FetchOutcome};
pub use scheduler::{
    ExitReason, JobControl, JobExit, PeriodicJob, Scheduler, SchedulerHandle, ShutdownSignal,
};
pub use staging::{STAGING_CHUNK_SIZE, StagedImage, StagingSlot, with_deadline};
