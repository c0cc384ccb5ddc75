//! Error kinds and their retry classification
//!
//! Every failure that can reach the retry controller, the queue or a cycle
//! result is reduced to an [`ErrorKind`]. The kind alone decides how the
//! failure is handled: retried with backoff, recorded against one task, or
//! treated as fatal for the whole cycle.

use std::fmt::{self, Display, Formatter};
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a failure of a given kind is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Back off and try again
    Retryable,
    /// The task is dead; other tasks continue
    TerminalTask,
    /// The cycle aborts without draining
    TerminalGlobal,
}

/// Policy table key for every failure in the sync core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // --- retryable ---
    NetworkTimeout,
    ConnectionRefused,
    ConnectionLost,
    DeviceBusy,
    TransientIo,
    LockContention,
    /// Bytes read while streaming did not match the expected fingerprint
    ChecksumMismatch,
    /// The source changed between scan and transfer
    SourceChanged,
    VolumeRemoved,

    // --- terminal per task ---
    SourceMissing,
    DestinationFull,
    PermissionDenied,
    Unreadable,
    /// A completed write read back with the wrong fingerprint
    VerifyFailed,
    Protocol,
    CapacityExceeded,
    /// A dead task dropped from the queue by back-pressure or expiry
    Evicted,

    // --- terminal global ---
    InvalidConfig,
    ArchiveUnavailable,
}

impl ErrorKind {
    /// Classification of this kind
    #[must_use]
    pub const fn class(self) -> ErrorClass {
        use ErrorKind::*;
        match self {
            NetworkTimeout | ConnectionRefused | ConnectionLost | DeviceBusy | TransientIo
            | LockContention | ChecksumMismatch | SourceChanged | VolumeRemoved => {
                ErrorClass::Retryable
            }
            SourceMissing | DestinationFull | PermissionDenied | Unreadable | VerifyFailed
            | Protocol | CapacityExceeded | Evicted => ErrorClass::TerminalTask,
            InvalidConfig | ArchiveUnavailable => ErrorClass::TerminalGlobal,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self.class(), ErrorClass::Retryable)
    }

    #[must_use]
    pub const fn is_global(self) -> bool {
        matches!(self.class(), ErrorClass::TerminalGlobal)
    }

    /// Stable snake_case name used in logs, storage and the wire protocol
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        use ErrorKind::*;
        match self {
            NetworkTimeout => "network_timeout",
            ConnectionRefused => "connection_refused",
            ConnectionLost => "connection_lost",
            DeviceBusy => "device_busy",
            TransientIo => "transient_io",
            LockContention => "lock_contention",
            ChecksumMismatch => "checksum_mismatch",
            SourceChanged => "source_changed",
            VolumeRemoved => "volume_removed",
            SourceMissing => "source_missing",
            DestinationFull => "destination_full",
            PermissionDenied => "permission_denied",
            Unreadable => "unreadable",
            VerifyFailed => "verify_failed",
            Protocol => "protocol",
            CapacityExceeded => "capacity_exceeded",
            Evicted => "evicted",
            InvalidConfig => "invalid_config",
            ArchiveUnavailable => "archive_unavailable",
        }
    }

    /// Classify an I/O error, looking at the OS error code first
    #[must_use]
    pub fn from_io(err: &io::Error) -> Self {
        if let Some(kind) = err.raw_os_error().and_then(from_errno) {
            return kind;
        }
        match err.kind() {
            io::ErrorKind::NotFound => ErrorKind::SourceMissing,
            io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            io::ErrorKind::TimedOut => ErrorKind::NetworkTimeout,
            io::ErrorKind::ConnectionRefused => ErrorKind::ConnectionRefused,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => ErrorKind::ConnectionLost,
            io::ErrorKind::WouldBlock => ErrorKind::LockContention,
            io::ErrorKind::InvalidData => ErrorKind::Protocol,
            _ => ErrorKind::TransientIo,
        }
    }
}

#[cfg(unix)]
fn from_errno(code: i32) -> Option<ErrorKind> {
    match code {
        libc::ENOSPC | libc::EDQUOT | libc::EFBIG => Some(ErrorKind::DestinationFull),
        libc::EBUSY | libc::ETXTBSY => Some(ErrorKind::DeviceBusy),
        libc::ENODEV | libc::ENXIO => Some(ErrorKind::VolumeRemoved),
        libc::EACCES | libc::EPERM | libc::EROFS => Some(ErrorKind::PermissionDenied),
        libc::EIO => Some(ErrorKind::TransientIo),
        libc::EAGAIN => Some(ErrorKind::LockContention),
        _ => None,
    }
}

#[cfg(not(unix))]
fn from_errno(_code: i32) -> Option<ErrorKind> {
    None
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure of a transfer, probe or reconciliation step
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct TransferError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TransferError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify an I/O error and prefix its message with `context`
    pub fn io(context: impl Display, err: &io::Error) -> Self {
        Self::new(ErrorKind::from_io(err), format!("{context}: {err}"))
    }

    #[must_use]
    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<io::Error> for TransferError {
    fn from(err: io::Error) -> Self {
        Self::new(ErrorKind::from_io(&err), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_table() {
        for kind in [
            ErrorKind::NetworkTimeout,
            ErrorKind::ConnectionRefused,
            ErrorKind::DeviceBusy,
            ErrorKind::TransientIo,
            ErrorKind::LockContention,
            ErrorKind::ChecksumMismatch,
            ErrorKind::VolumeRemoved,
        ] {
            assert_eq!(kind.class(), ErrorClass::Retryable, "{kind}");
        }
        for kind in [
            ErrorKind::DestinationFull,
            ErrorKind::PermissionDenied,
            ErrorKind::Unreadable,
            ErrorKind::VerifyFailed,
        ] {
            assert_eq!(kind.class(), ErrorClass::TerminalTask, "{kind}");
        }
        assert!(ErrorKind::InvalidConfig.is_global());
        assert!(ErrorKind::ArchiveUnavailable.is_global());
    }

    #[cfg(unix)]
    #[test]
    fn test_from_io_uses_errno() {
        let full = io::Error::from_raw_os_error(libc::ENOSPC);
        assert_eq!(ErrorKind::from_io(&full), ErrorKind::DestinationFull);
        let busy = io::Error::from_raw_os_error(libc::EBUSY);
        assert_eq!(ErrorKind::from_io(&busy), ErrorKind::DeviceBusy);
        let gone = io::Error::from_raw_os_error(libc::ENODEV);
        assert_eq!(ErrorKind::from_io(&gone), ErrorKind::VolumeRemoved);
        let denied = io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(ErrorKind::from_io(&denied), ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_from_io_falls_back_to_kind() {
        let err = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert_eq!(ErrorKind::from_io(&err), ErrorKind::NetworkTimeout);
        let err = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(ErrorKind::from_io(&err), ErrorKind::SourceMissing);
        let err = io::Error::new(io::ErrorKind::Other, "??");
        assert_eq!(ErrorKind::from_io(&err), ErrorKind::TransientIo);
    }

    #[test]
    fn test_transfer_error_display_and_serde() {
        let err = TransferError::new(ErrorKind::DestinationFull, "no space on /mnt");
        assert_eq!(err.to_string(), "destination_full: no space on /mnt");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"destination_full\""));
        let back: TransferError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
