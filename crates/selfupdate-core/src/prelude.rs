//! Convenience re-exports for wiring the updater

pub use std::sync::Arc;

pub use crate::apply::{ApplyAgent, ApplyOutcome, ApplyPhase};
pub use crate::capability::{
    BlockStorage, DeviceRestart, FirmwareFlash, ImageBody, StagedReader, StagingWriter,
    UpdateCheck, UpdateOffer, UpdateSource,
};
pub use crate::config::{SizeMismatchPolicy, UpdaterConfig};
pub use crate::coordinator::{Coordinator, GateState};
pub use crate::error::{ErrorClass, FlashError, FlashErrorCode, UpdateError};
pub use crate::fetch::{FetchAgent, FetchOutcome};
pub use crate::host::{DirectoryStorage, FilePartition, HttpUpdateSource, ShutdownRestart};
pub use crate::scheduler::{JobControl, PeriodicJob, Scheduler, ShutdownSignal};
pub use crate::staging::{StagedImage, StagingSlot};
