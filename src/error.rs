// Error taxonomy for a flashing run.
//
// `FlashError` is what the engine raises internally. Events and results carry
// the serializable `ErrorReport` instead, since they cross a process boundary.

use crate::pipeline::checksum::ChecksumSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlashError {
    #[error("destination {device} does not exist")]
    Unresolved { device: String },

    #[error("destination {device} is too small: {device_size} bytes available, {image_size} bytes needed")]
    Capacity {
        device: String,
        image_size: u64,
        device_size: u64,
    },

    #[error("failed to {step} {device}: {reason}")]
    Preparation {
        device: String,
        step: PrepareStep,
        reason: String,
    },

    #[error("destination {device} was removed: {source}")]
    DeviceRemoved {
        device: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error on {device}: {source}")]
    Io {
        device: String,
        #[source]
        source: io::Error,
    },

    #[error("verification of {device} failed: expected {expected}, got {actual}")]
    Validation {
        device: String,
        expected: ChecksumSet,
        actual: ChecksumSet,
    },

    #[error("range at {offset} (+{length}) has checksum {actual}, expected {expected}")]
    RangeChecksum {
        offset: u64,
        length: u64,
        expected: String,
        actual: String,
    },

    #[error("image checksum {actual} does not match the block map ({expected})")]
    ImageChecksum { expected: String, actual: String },

    #[error("invalid block map: {0}")]
    BlockMap(String),

    #[error("failed to read the source image: {0}")]
    Source(#[source] io::Error),

    #[error("all destinations failed")]
    AllDestinationsFailed,

    #[error("the operation was cancelled")]
    Cancelled,
}

/// The preparation step that failed for a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrepareStep {
    Unmount,
    CleanPartitionTable,
    Open,
}

impl fmt::Display for PrepareStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PrepareStep::Unmount => "unmount",
            PrepareStep::CleanPartitionTable => "clean the partition table of",
            PrepareStep::Open => "open",
        })
    }
}

/// Stable error codes reported to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "ENODEVICE")]
    NoDevice,
    #[serde(rename = "ETOOSMALL")]
    TooSmall,
    #[serde(rename = "EPREPARE")]
    Prepare,
    #[serde(rename = "EUNPLUGGED")]
    Unplugged,
    #[serde(rename = "EIO")]
    Io,
    #[serde(rename = "EVALIDATION")]
    Validation,
    #[serde(rename = "EBLOCKMAP")]
    BlockMap,
    #[serde(rename = "ESOURCE")]
    Source,
    #[serde(rename = "EALLFAILED")]
    AllFailed,
    #[serde(rename = "ECANCELLED")]
    Cancelled,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NoDevice => "ENODEVICE",
            ErrorCode::TooSmall => "ETOOSMALL",
            ErrorCode::Prepare => "EPREPARE",
            ErrorCode::Unplugged => "EUNPLUGGED",
            ErrorCode::Io => "EIO",
            ErrorCode::Validation => "EVALIDATION",
            ErrorCode::BlockMap => "EBLOCKMAP",
            ErrorCode::Source => "ESOURCE",
            ErrorCode::AllFailed => "EALLFAILED",
            ErrorCode::Cancelled => "ECANCELLED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FlashError {
    pub fn code(&self) -> ErrorCode {
        match self {
            FlashError::Unresolved { .. } => ErrorCode::NoDevice,
            FlashError::Capacity { .. } => ErrorCode::TooSmall,
            FlashError::Preparation { .. } => ErrorCode::Prepare,
            FlashError::DeviceRemoved { .. } => ErrorCode::Unplugged,
            FlashError::Io { .. } => ErrorCode::Io,
            FlashError::Validation { .. }
            | FlashError::RangeChecksum { .. }
            | FlashError::ImageChecksum { .. } => ErrorCode::Validation,
            FlashError::BlockMap(_) => ErrorCode::BlockMap,
            FlashError::Source(_) => ErrorCode::Source,
            FlashError::AllDestinationsFailed => ErrorCode::AllFailed,
            FlashError::Cancelled => ErrorCode::Cancelled,
        }
    }

    pub fn report(&self, device: Option<&str>) -> ErrorReport {
        ErrorReport {
            code: self.code(),
            message: self.to_string(),
            device: device.map(str::to_string),
        }
    }
}

/// Serializable form of an error, sent with `fail`, `error` and `done` events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Whether an I/O error is worth retrying (device busy, temporarily unavailable)
pub fn is_transient_error(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        if let Some(code) = err.raw_os_error() {
            return matches!(
                code,
                libc::EAGAIN | libc::EBUSY | libc::EINTR | libc::ETIMEDOUT
            );
        }
    }

    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_errors() {
        assert!(is_transient_error(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_transient_error(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(!is_transient_error(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
        assert!(!is_transient_error(&io::Error::from(io::ErrorKind::UnexpectedEof)));
    }

    #[cfg(unix)]
    #[test]
    fn classifies_raw_os_codes() {
        assert!(is_transient_error(&io::Error::from_raw_os_error(libc::EBUSY)));
        assert!(is_transient_error(&io::Error::from_raw_os_error(libc::EAGAIN)));
        assert!(!is_transient_error(&io::Error::from_raw_os_error(libc::EIO)));
        assert!(!is_transient_error(&io::Error::from_raw_os_error(libc::ENOSPC)));
    }

    #[test]
    fn report_serializes_code() {
        let err = FlashError::DeviceRemoved {
            device: "/dev/sdb".into(),
            source: io::Error::from(io::ErrorKind::WouldBlock),
        };
        let report = err.report(Some("/dev/sdb"));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["code"], "EUNPLUGGED");
        assert_eq!(json["device"], "/dev/sdb");
    }
}
