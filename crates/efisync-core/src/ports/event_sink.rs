//! Event sink port (driven/secondary port)
//!
//! Structured events describing what the sync core did. The daemon's
//! default sink writes them to `tracing`; a desktop notifier or a status
//! endpoint would implement the same trait.
//!
//! ## Design Notes
//!
//! - Emission is fire-and-forget: a failing sink never fails a transfer.
//! - Every event carries enough context to be logged on its own.

use serde::{Deserialize, Serialize};

use super::reachability::Reachability;
use crate::domain::{CycleStatus, CycleTrigger, ErrorKind, TaskId, TaskKind};

/// A structured sync event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    TaskSucceeded {
        task_id: TaskId,
        kind: TaskKind,
        path: String,
        bytes: u64,
        /// Attempts the task took, counting earlier cycles
        attempts: u32,
        duration_ms: u64,
    },
    TaskFailed {
        task_id: TaskId,
        kind: TaskKind,
        path: String,
        error_kind: ErrorKind,
        message: String,
        attempts: u32,
        /// The task reached the dead state with this failure
        dead: bool,
    },
    /// A dead task was dropped by back-pressure or age
    TaskEvicted {
        task_id: TaskId,
        path: String,
        error_kind: Option<ErrorKind>,
    },
    VolumeReconciled {
        volume_id: String,
        mount_path: String,
        extracted: usize,
        injected: usize,
        unchanged: usize,
        bytes: u64,
        duration_ms: u64,
        error_kind: Option<ErrorKind>,
    },
    CycleCompleted {
        trigger: CycleTrigger,
        status: CycleStatus,
        files: u64,
        bytes: u64,
        errors: usize,
        duration_ms: u64,
    },
    ReachabilityChanged {
        endpoint: String,
        from: Reachability,
        to: Reachability,
    },
}

impl SyncEvent {
    /// Event name as used in logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::TaskSucceeded { .. } => "task_succeeded",
            SyncEvent::TaskFailed { .. } => "task_failed",
            SyncEvent::TaskEvicted { .. } => "task_evicted",
            SyncEvent::VolumeReconciled { .. } => "volume_reconciled",
            SyncEvent::CycleCompleted { .. } => "cycle_completed",
            SyncEvent::ReachabilityChanged { .. } => "reachability_changed",
        }
    }
}

#[async_trait::async_trait]
pub trait IEventSink: Send + Sync {
    /// Deliver one event
    async fn emit(&self, event: &SyncEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_tag() {
        let event = SyncEvent::CycleCompleted {
            trigger: CycleTrigger::Scheduled,
            status: CycleStatus::Partial,
            files: 2,
            bytes: 30,
            errors: 1,
            duration_ms: 12,
        };
        assert_eq!(event.name(), "cycle_completed");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "cycle_completed");
        assert_eq!(json["status"], "partial");
    }

    #[test]
    fn test_names() {
        let failed = SyncEvent::TaskFailed {
            task_id: TaskId::new(),
            kind: TaskKind::Push,
            path: "a.log".into(),
            error_kind: ErrorKind::DestinationFull,
            message: "full".into(),
            attempts: 1,
            dead: true,
        };
        assert_eq!(failed.name(), "task_failed");
        let changed = SyncEvent::ReachabilityChanged {
            endpoint: "h:1".into(),
            from: Reachability::Unknown,
            to: Reachability::Reachable,
        };
        assert_eq!(changed.name(), "reachability_changed");
    }
}
