//! Error types for the migration engine.
//!
//! `EngineError` represents run-level errors that prevent planning, execution,
//! or verification from proceeding at all. Unit-level failures (a single file
//! that could not be read or written) are recorded on the `TransferUnit` as a
//! `UnitError`, never returned as `EngineError`.

use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checksums::ChecksumAlgorithm;
use crate::model::{UnitId, UnitState};

/// Result alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that stop a run (or a single store operation) outright.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Source root does not exist
    #[error("source root not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    /// Source root exists but is not a directory
    #[error("source root is not a directory: {}", path.display())]
    SourceNotDirectory { path: PathBuf },

    /// Source root could not be inspected
    #[error("source root access denied: {}", path.display())]
    SourceAccessDenied { path: PathBuf, source: io::Error },

    /// Destination root could not be created or inspected
    #[error("destination not accessible: {}", path.display())]
    DestinationAccessDenied { path: PathBuf, source: io::Error },

    /// Failed to read a file while hashing
    #[error("failed to read file: {}", path.display())]
    ReadError { path: PathBuf, source: io::Error },

    /// Failed to enumerate a source tree at the root level
    #[error("failed to enumerate directory: {}", path.display())]
    EnumerationFailed { path: PathBuf, source: walkdir::Error },

    /// A configuration value was rejected at startup
    #[error("invalid configuration for `{field}`: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    /// Reading or appending the manifest log failed
    #[error("manifest io failure ({operation}): {}", path.display())]
    ManifestIo {
        operation: &'static str,
        path: PathBuf,
        source: io::Error,
    },

    /// A manifest record could not be serialized
    #[error("manifest record could not be encoded")]
    ManifestEncode { source: serde_json::Error },

    /// The manifest was created with a different content hash
    #[error("manifest uses {stored} hashing but {requested} was requested")]
    AlgorithmMismatch {
        stored: ChecksumAlgorithm,
        requested: ChecksumAlgorithm,
    },

    /// The requested state change is not an edge of the unit state graph
    #[error("illegal transition for unit {unit}: {from} -> {to}")]
    IllegalTransition {
        unit: UnitId,
        from: UnitState,
        to: UnitState,
    },

    /// Failed -> Copying was requested after the last permitted attempt
    #[error("unit {unit} exhausted its {max_attempts} copy attempts")]
    RetryLimitExceeded { unit: UnitId, max_attempts: u32 },

    /// No unit with this id exists in the store
    #[error("unknown unit {unit}")]
    UnknownUnit { unit: UnitId },

    /// A second source mapped to an id already held by another unit
    #[error("unit {unit} for {} is already planned for {}", source_path.display(), existing.display())]
    DuplicateUnit {
        unit: UnitId,
        source_path: PathBuf,
        existing: PathBuf,
    },

    /// Only Planned units can be discarded from the manifest
    #[error("unit {unit} is {state}; only planned units can be discarded")]
    NotDiscardable { unit: UnitId, state: UnitState },
}

impl EngineError {
    pub(crate) fn manifest_io(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: io::Error,
    ) -> Self {
        Self::ManifestIo {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid_config(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }
}

/// Classification of a per-unit copy failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitErrorKind {
    /// Source vanished or could not be read
    SourceUnreadable,
    /// Disk full, permission denied, or any other write-side failure
    DestinationWriteError,
    /// The copy attempt ran past its deadline
    Timeout,
    /// The unit was left mid-copy by a run that never finished
    Interrupted,
}

impl fmt::Display for UnitErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SourceUnreadable => write!(f, "source unreadable"),
            Self::DestinationWriteError => write!(f, "destination write error"),
            Self::Timeout => write!(f, "timeout"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// A per-unit failure as it is recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitError {
    pub kind: UnitErrorKind,
    pub message: String,
    /// Raw OS error number, when the failure came from the OS
    pub os_code: Option<i32>,
}

impl fmt::Display for UnitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.os_code {
            Some(code) => write!(f, "{}: {} (os error {})", self.kind, self.message, code),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

/// Error returned by a single copy attempt.
#[derive(Debug, Error)]
#[error("{kind} at {}", path.display())]
pub struct CopyError {
    pub kind: UnitErrorKind,
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl CopyError {
    pub fn source_unreadable(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self {
            kind: UnitErrorKind::SourceUnreadable,
            path: path.into(),
            source,
        }
    }

    pub fn destination(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self {
            kind: UnitErrorKind::DestinationWriteError,
            path: path.into(),
            source,
        }
    }

    pub fn timeout(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: UnitErrorKind::Timeout,
            path: path.into(),
            source: io::Error::new(io::ErrorKind::TimedOut, "copy attempt exceeded its deadline"),
        }
    }

    /// Convert into the form persisted on the unit.
    pub fn to_unit_error(&self) -> UnitError {
        UnitError {
            kind: self.kind,
            message: format!("{}: {}", self.path.display(), self.source),
            os_code: self.source.raw_os_error(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_copy_error_keeps_os_code() {
        let err = CopyError::destination("/dst/a.txt", io::Error::from_raw_os_error(28));
        let unit_err = err.to_unit_error();
        assert_eq!(unit_err.kind, UnitErrorKind::DestinationWriteError);
        assert_eq!(unit_err.os_code, Some(28));
        assert!(unit_err.to_string().contains("os error 28"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_timeout_error_has_no_os_code() {
        let unit_err = CopyError::timeout("/dst/b.bin").to_unit_error();
        assert_eq!(unit_err.kind, UnitErrorKind::Timeout);
        assert_eq!(unit_err.os_code, None);
    }

    #[test]
    fn test_illegal_transition_message() {
        let err = EngineError::IllegalTransition {
            unit: UnitId::from_hex("00ff"),
            from: UnitState::Verified,
            to: UnitState::Copying,
        };
        assert_eq!(err.to_string(), "illegal transition for unit 00ff: verified -> copying");
    }
}
