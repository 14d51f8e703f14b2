//! Capability implementations for Linux-class hosts
//!
//! - [`HttpUpdateSource`]: availability requests and streamed image bodies over HTTP
//! - [`DirectoryStorage`]: block storage backed by a directory
//! - [`FilePartition`]: firmware partition backed by a single image file
//! - [`ShutdownRestart`]: restart by asking the daemon to exit so the service
//!   manager starts the new image

mod flash;
mod http;
mod restart;
mod storage;

pub use flash::FilePartition;
pub use http::{CHECKSUM_HEADER, HttpUpdateSource, VERSION_HEADER};
pub use restart::ShutdownRestart;
pub use storage::DirectoryStorage;
