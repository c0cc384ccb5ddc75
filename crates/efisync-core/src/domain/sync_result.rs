//! SyncResult - outcome of one orchestrator cycle

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error_kind::{ErrorClass, ErrorKind};
use super::newtypes::TaskId;

/// Overall outcome of a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Success,
    Partial,
    Failed,
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleStatus::Success => write!(f, "success"),
            CycleStatus::Partial => write!(f, "partial"),
            CycleStatus::Failed => write!(f, "failed"),
        }
    }
}

/// What started a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleTrigger {
    Scheduled,
    Requested,
    /// The endpoint became reachable again
    Reconnected,
}

/// One error recorded during a cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleError {
    pub task_id: Option<TaskId>,
    pub path: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

impl CycleError {
    /// An error not tied to any task or volume
    pub fn global(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            task_id: None,
            path: None,
            kind,
            message: message.into(),
        }
    }

    /// An error affecting a whole volume session rather than one task
    ///
    /// Whether it fails the cycle still follows from `kind`.
    pub fn volume(
        kind: ErrorKind,
        mount_path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            task_id: None,
            path: Some(mount_path.into()),
            kind,
            message: message.into(),
        }
    }
}

/// Counters and errors of one cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub trigger: CycleTrigger,
    pub started_at: DateTime<Utc>,
    pub files_transferred: u64,
    pub bytes_transferred: u64,
    pub errors: Vec<CycleError>,
    pub duration_ms: u64,
    pub status: CycleStatus,
}

impl SyncResult {
    /// Start an empty result; status stays `Success` until [`finish`](Self::finish)
    #[must_use]
    pub fn begin(trigger: CycleTrigger) -> Self {
        Self {
            trigger,
            started_at: Utc::now(),
            files_transferred: 0,
            bytes_transferred: 0,
            errors: Vec::new(),
            duration_ms: 0,
            status: CycleStatus::Success,
        }
    }

    pub fn record_transfer(&mut self, bytes: u64) {
        self.files_transferred += 1;
        self.bytes_transferred += bytes;
    }

    pub fn record_error(&mut self, error: CycleError) {
        self.errors.push(error);
    }

    /// True when a global error aborted the cycle
    #[must_use]
    pub fn has_global_error(&self) -> bool {
        self.errors
            .iter()
            .any(|e| e.kind.class() == ErrorClass::TerminalGlobal)
    }

    /// Derive the status and stamp the duration
    ///
    /// Any global error fails the cycle; any other error makes it partial.
    pub fn finish(&mut self) {
        self.duration_ms = (Utc::now() - self.started_at)
            .num_milliseconds()
            .max(0) as u64;
        self.status = if self.has_global_error() {
            CycleStatus::Failed
        } else if self.errors.is_empty() {
            CycleStatus::Success
        } else {
            CycleStatus::Partial
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_cycle_succeeds() {
        let mut r = SyncResult::begin(CycleTrigger::Scheduled);
        r.finish();
        assert_eq!(r.status, CycleStatus::Success);
    }

    #[test]
    fn test_task_error_is_partial() {
        let mut r = SyncResult::begin(CycleTrigger::Requested);
        r.record_transfer(30);
        r.record_error(CycleError {
            task_id: Some(TaskId::new()),
            path: Some("a.log".into()),
            kind: ErrorKind::NetworkTimeout,
            message: "timed out".into(),
        });
        r.finish();
        assert_eq!(r.status, CycleStatus::Partial);
        assert_eq!(r.files_transferred, 1);
        assert_eq!(r.bytes_transferred, 30);
    }

    #[test]
    fn test_global_error_fails() {
        let mut r = SyncResult::begin(CycleTrigger::Reconnected);
        r.record_error(CycleError::global(
            ErrorKind::ArchiveUnavailable,
            "archive root missing",
        ));
        r.finish();
        assert_eq!(r.status, CycleStatus::Failed);
        assert_eq!(r.status.to_string(), "failed");
    }

    #[test]
    fn test_volume_errors_do_not_fail_the_cycle() {
        let mut r = SyncResult::begin(CycleTrigger::Scheduled);
        r.record_error(CycleError::volume(
            ErrorKind::CapacityExceeded,
            "/media/efis",
            "injects need 23 bytes, 22 free",
        ));
        r.record_error(CycleError::volume(
            ErrorKind::VolumeRemoved,
            "/media/efis",
            "no longer mounted",
        ));
        r.finish();
        assert!(!r.has_global_error());
        assert_eq!(r.status, CycleStatus::Partial);
        assert_eq!(r.errors[0].path.as_deref(), Some("/media/efis"));
        assert!(r.errors[0].task_id.is_none());
    }
}
