#![forbid(unsafe_code)]
//! Error types for Strata.
//!
//! Defines `StrataError` and a `Result<T>` alias used throughout the
//! workspace. Format and stuck errors indicate the persistent store is
//! either not ours or irrecoverably damaged; callers on those paths log
//! and abort rather than propagate.

use thiserror::Error;

/// Unified error type for all Strata operations.
#[derive(Debug, Error)]
pub enum StrataError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transient or permanent I/O failure on a raw device data region.
    /// Surfaced to the caller without retry at this layer.
    #[error("device I/O error on {dev}: {source}")]
    DeviceIo {
        dev: String,
        #[source]
        source: std::io::Error,
    },

    /// Magic/CRC/version/uuid/device-count mismatch. Fatal at boot.
    #[error("device format error: {0}")]
    DeviceFormat(String),

    /// No free vdev id, chunk id, or log space.
    #[error("out of resource: {0}")]
    OutOfResource(&'static str),

    /// Misaligned offset, oversize record, unknown store id.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Record CRC or size check failed during log recovery. The tail is
    /// truncated and boot continues.
    #[error("corrupt log record at offset {offset}: {detail}")]
    CorruptLog { offset: u64, detail: String },

    /// Checkpoint watchdog ceiling exceeded.
    #[error("checkpoint stuck: {0}")]
    Stuck(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Result alias using `StrataError`.
pub type Result<T> = std::result::Result<T, StrataError>;

impl StrataError {
    /// Whether this error class is fatal by contract: the persistent
    /// store is either foreign or damaged beyond online repair.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceFormat(_) | Self::Stuck(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(StrataError::DeviceFormat("bad magic".to_owned()).is_fatal());
        assert!(StrataError::Stuck("no progress".to_owned()).is_fatal());
        assert!(!StrataError::OutOfResource("vdev ids").is_fatal());
        assert!(!StrataError::CorruptLog {
            offset: 0,
            detail: "crc".to_owned()
        }
        .is_fatal());
    }

    #[test]
    fn io_error_conversion() {
        fn inner() -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))?;
            Ok(())
        }
        assert!(matches!(inner(), Err(StrataError::Io(_))));
    }
}
