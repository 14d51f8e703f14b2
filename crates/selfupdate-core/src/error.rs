//! Error types for self-update operations

use core::fmt;
use std::time::Duration;

use thiserror::Error;

/// Raw error code reported by the flash-write primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FlashErrorCode(pub u8);

impl FlashErrorCode {
    /// No error recorded
    pub const NONE: Self = Self(0);
    /// Write to flash failed
    pub const WRITE: Self = Self(1);
    /// Erase of the target region failed
    pub const ERASE: Self = Self(2);
    /// Not enough space in the update partition
    pub const SPACE: Self = Self(4);
    /// Image size does not match what was written
    pub const SIZE: Self = Self(5);
    /// Stream read from the source timed out
    pub const STREAM: Self = Self(6);
    /// Verification after write failed
    pub const VERIFY: Self = Self(7);
    /// `end()` or `write()` called without a successful `begin()`
    pub const NOT_STARTED: Self = Self(8);
    /// Activation of the new image failed
    pub const ACTIVATE: Self = Self(11);
}

impl fmt::Display for FlashErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Failure reported by a [`FirmwareFlash`](crate::capability::FirmwareFlash) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlashError {
    /// The partition cannot hold an image of the requested size
    #[error("insufficient space: need {requested} bytes, partition holds {available}")]
    InsufficientSpace {
        /// Bytes requested by `begin`
        requested: u64,
        /// Bytes the partition can hold
        available: u64,
    },

    /// Any other primitive failure, with its raw code
    #[error("flash primitive failed (code {code}): {message}")]
    Primitive {
        /// Raw error code
        code: FlashErrorCode,
        /// Human readable detail
        message: String,
    },
}

impl FlashError {
    /// Build a primitive failure from a code and a message.
    pub fn primitive(code: FlashErrorCode, message: impl Into<String>) -> Self {
        FlashError::Primitive {
            code,
            message: message.into(),
        }
    }

    /// Raw error code for diagnostics.
    pub fn code(&self) -> FlashErrorCode {
        match self {
            FlashError::InsufficientSpace { .. } => FlashErrorCode::SPACE,
            FlashError::Primitive { code, .. } => *code,
        }
    }
}

/// Errors that can occur while fetching or applying an update
#[derive(Error, Debug)]
pub enum UpdateError {
    /// Transport-level failure talking to the update endpoint
    #[error("Network error: {0}")]
    Network(String),

    /// Block storage could not be mounted
    #[error("Storage mount failed: {0}")]
    StorageMount(String),

    /// Storage I/O error
    #[error("Storage error: {context}: {source}")]
    Storage {
        /// What was being done
        context: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A network read or storage operation exceeded its deadline
    #[error("Timed out after {timeout:?} during {operation}")]
    Timeout {
        /// Operation that timed out
        operation: &'static str,
        /// Deadline that was exceeded
        timeout: Duration,
    },

    /// Download ended before the declared length was received
    #[error("Truncated download: expected {expected} bytes, received {received}")]
    Truncated {
        /// Length declared by the endpoint
        expected: u64,
        /// Bytes actually written to the partial slot
        received: u64,
    },

    /// Downloaded image does not match the advertised digest
    #[error("Checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch {
        /// Digest advertised by the endpoint
        expected: String,
        /// Digest of the bytes received
        actual: String,
    },

    /// The endpoint did not advertise a digest but one is required
    #[error("Update offer carries no checksum and checksums are required")]
    ChecksumMissing,

    /// Staged image is unusable (e.g. zero length)
    #[error("Corrupt staged image: {0}")]
    CorruptImage(String),

    /// Flash primitive rejected the image size
    #[error("Insufficient flash space: {0}")]
    Capacity(FlashError),

    /// Written byte count differs from the declared size and policy forbids finalizing
    #[error("Size mismatch: wrote {written} of {declared} bytes")]
    SizeMismatch {
        /// Declared image size
        declared: u64,
        /// Bytes accepted by the flash primitive
        written: u64,
    },

    /// Flash primitive failed while preparing or writing
    #[error("Flash error: {0}")]
    Flash(FlashError),

    /// Finalize reported failure or did not verify the image as complete
    #[error("Finalize failed (code {code}): {reason}")]
    FinalizeFailed {
        /// Last error code reported by the primitive
        code: FlashErrorCode,
        /// What went wrong
        reason: String,
    },
}

impl UpdateError {
    /// Wrap an I/O error with a description of the storage operation.
    pub fn storage(context: impl Into<String>, source: std::io::Error) -> Self {
        UpdateError::Storage {
            context: context.into(),
            source,
        }
    }

    /// Classify the error for retry and logging decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            UpdateError::Network(_)
            | UpdateError::StorageMount(_)
            | UpdateError::Storage { .. }
            | UpdateError::Timeout { .. }
            | UpdateError::Flash(_) => ErrorClass::Transient,
            UpdateError::Truncated { .. }
            | UpdateError::ChecksumMismatch { .. }
            | UpdateError::ChecksumMissing
            | UpdateError::CorruptImage(_)
            | UpdateError::SizeMismatch { .. }
            | UpdateError::FinalizeFailed { .. } => ErrorClass::CorruptArtifact,
            UpdateError::Capacity(_) => ErrorClass::Capacity,
        }
    }

    /// Flash error code attached to this error, if any.
    pub fn flash_code(&self) -> Option<FlashErrorCode> {
        match self {
            UpdateError::Capacity(e) | UpdateError::Flash(e) => Some(e.code()),
            UpdateError::FinalizeFailed { code, .. } => Some(*code),
            UpdateError::SizeMismatch { .. } => Some(FlashErrorCode::SIZE),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for UpdateError {
    fn from(e: reqwest::Error) -> Self {
        UpdateError::Network(e.to_string())
    }
}

/// Error classes used by the agents to decide how a failure is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Retried on the next scheduled tick with no other action
    Transient,
    /// The staged or downloaded artifact is unusable and was discarded
    CorruptArtifact,
    /// The image cannot fit; persists until the partition changes externally
    Capacity,
}

impl ErrorClass {
    /// Whether retrying on the next tick can plausibly succeed without outside change.
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorClass::Capacity)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::CorruptArtifact => write!(f, "corrupt-artifact"),
            ErrorClass::Capacity => write!(f, "capacity"),
        }
    }
}

/// Result alias for self-update operations.
pub type Result<T, E = UpdateError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            UpdateError::Network("refused".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            UpdateError::CorruptImage("zero length".into()).class(),
            ErrorClass::CorruptArtifact
        );
        assert_eq!(
            UpdateError::Capacity(FlashError::InsufficientSpace {
                requested: 10,
                available: 5
            })
            .class(),
            ErrorClass::Capacity
        );
        assert!(!ErrorClass::Capacity.is_retryable());
        assert!(ErrorClass::Transient.is_retryable());
    }

    #[test]
    fn test_flash_code_extraction() {
        let err = UpdateError::Capacity(FlashError::InsufficientSpace {
            requested: 10,
            available: 5,
        });
        assert_eq!(err.flash_code(), Some(FlashErrorCode::SPACE));

        let err = UpdateError::FinalizeFailed {
            code: FlashErrorCode::VERIFY,
            reason: "not finished".into(),
        };
        assert_eq!(err.flash_code(), Some(FlashErrorCode::VERIFY));
        assert_eq!(UpdateError::ChecksumMissing.flash_code(), None);
    }

    #[test]
    fn test_timeout_display() {
        let err = UpdateError::Timeout {
            operation: "network read",
            timeout: Duration::from_secs(5),
        };
        assert_eq!(err.to_string(), "Timed out after 5s during network read");
    }
}
