//! TransferTask domain entity
//!
//! A unit of work in the operation queue: move the content described by one
//! [`FileRecord`] from a source location to a destination.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error_kind::{ErrorKind, TransferError};
use super::errors::DomainError;
use super::file_record::FileRecord;
use super::newtypes::TaskId;

/// What a task does and where its endpoints live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Local file to the remote endpoint
    Push,
    /// Remote file to a local path
    Pull,
    /// Archive file onto a managed volume
    CopyToMedia,
    /// Device-generated file from a managed volume into the archive
    ExtractFromMedia,
}

impl TaskKind {
    /// Whether the task needs the remote endpoint
    #[must_use]
    pub const fn is_network(self) -> bool {
        matches!(self, TaskKind::Push | TaskKind::Pull)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            TaskKind::Push => "push",
            TaskKind::Pull => "pull",
            TaskKind::CopyToMedia => "copy_to_media",
            TaskKind::ExtractFromMedia => "extract_from_media",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(TaskKind::Push),
            "pull" => Ok(TaskKind::Pull),
            "copy_to_media" => Ok(TaskKind::CopyToMedia),
            "extract_from_media" => Ok(TaskKind::ExtractFromMedia),
            other => Err(DomainError::UnknownVariant {
                what: "task kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Lifecycle state of a task
///
/// ```text
/// Created -> Queued -> InFlight -> (removed on success)
///               ^          |
///               +----------+ failure below the attempt ceiling
///                          |
///                          +-> Dead (ceiling reached or terminal error)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Created,
    Queued,
    InFlight,
    Dead,
}

impl TaskState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            TaskState::Created => "created",
            TaskState::Queued => "queued",
            TaskState::InFlight => "in_flight",
            TaskState::Dead => "dead",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(TaskState::Created),
            "queued" => Ok(TaskState::Queued),
            "in_flight" => Ok(TaskState::InFlight),
            "dead" => Ok(TaskState::Dead),
            other => Err(DomainError::UnknownVariant {
                what: "task state",
                value: other.to_string(),
            }),
        }
    }
}

/// The last failure recorded on a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl From<&TransferError> for TaskError {
    fn from(err: &TransferError) -> Self {
        Self {
            kind: err.kind,
            message: err.message.clone(),
            at: Utc::now(),
        }
    }
}

/// A queued transfer of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTask {
    pub id: TaskId,
    /// Position in the queue; assigned on enqueue and on every re-queue
    pub sequence: u64,
    pub kind: TaskKind,
    pub state: TaskState,
    /// Where the bytes are read from: an absolute local path, or a remote
    /// record path for pulls
    pub source: String,
    /// Where the bytes go: a remote record path for pushes, otherwise an
    /// absolute local path
    pub destination: String,
    /// The source content this task must deliver
    pub record: FileRecord,
    pub attempts: u32,
    pub last_error: Option<TaskError>,
    pub enqueued_at: DateTime<Utc>,
    /// Not eligible for dequeue before this instant
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl TransferTask {
    /// Create a task in the `Created` state
    pub fn new(
        kind: TaskKind,
        source: impl Into<String>,
        destination: impl Into<String>,
        record: FileRecord,
    ) -> Self {
        Self {
            id: TaskId::new(),
            sequence: 0,
            kind,
            state: TaskState::Created,
            source: source.into(),
            destination: destination.into(),
            record,
            attempts: 0,
            last_error: None,
            enqueued_at: Utc::now(),
            next_attempt_at: None,
        }
    }

    /// Tasks with equal keys describe the same move and coalesce in the queue
    #[must_use]
    pub fn coalesce_key(&self) -> (TaskKind, &str, &str) {
        (self.kind, self.source.as_str(), self.destination.as_str())
    }

    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.state == TaskState::Dead
    }

    /// Whether the task may be claimed at `now`
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }

    fn transition(&mut self, allowed: &[TaskState], to: TaskState) -> Result<(), DomainError> {
        if !allowed.contains(&self.state) {
            return Err(DomainError::InvalidState {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        Ok(())
    }

    /// Created -> Queued
    pub fn mark_queued(&mut self, sequence: u64) -> Result<(), DomainError> {
        self.transition(&[TaskState::Created], TaskState::Queued)?;
        self.sequence = sequence;
        self.enqueued_at = Utc::now();
        Ok(())
    }

    /// Queued -> InFlight
    pub fn mark_in_flight(&mut self) -> Result<(), DomainError> {
        self.transition(&[TaskState::Queued], TaskState::InFlight)
    }

    /// Record one failed attempt without changing state
    pub fn record_failure(&mut self, error: &TransferError) {
        self.attempts += 1;
        self.last_error = Some(TaskError::from(error));
    }

    /// InFlight -> Queued at the back of the queue
    pub fn requeue(
        &mut self,
        sequence: u64,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<(), DomainError> {
        self.transition(&[TaskState::InFlight], TaskState::Queued)?;
        self.sequence = sequence;
        self.next_attempt_at = not_before;
        Ok(())
    }

    /// InFlight -> Queued keeping the queue position
    pub fn release(&mut self) -> Result<(), DomainError> {
        self.transition(&[TaskState::InFlight], TaskState::Queued)
    }

    /// InFlight -> Dead
    pub fn mark_dead(&mut self) -> Result<(), DomainError> {
        self.transition(&[TaskState::InFlight], TaskState::Dead)
    }

    /// Time the task has been waiting since it was enqueued
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.enqueued_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::newtypes::{Fingerprint, RecordPath};

    fn task() -> TransferTask {
        let record = FileRecord::new(
            RecordPath::new("a.log").unwrap(),
            10,
            Fingerprint::new("0".repeat(64)).unwrap(),
            Utc::now(),
        );
        TransferTask::new(TaskKind::Push, "/data/a.log", "logs/a.log", record)
    }

    #[test]
    fn test_kind_roundtrip_and_network() {
        for kind in [
            TaskKind::Push,
            TaskKind::Pull,
            TaskKind::CopyToMedia,
            TaskKind::ExtractFromMedia,
        ] {
            assert_eq!(kind.as_str().parse::<TaskKind>().unwrap(), kind);
        }
        assert!(TaskKind::Push.is_network());
        assert!(TaskKind::Pull.is_network());
        assert!(!TaskKind::CopyToMedia.is_network());
        assert!("teleport".parse::<TaskKind>().is_err());
    }

    #[test]
    fn test_state_roundtrip() {
        for state in [
            TaskState::Created,
            TaskState::Queued,
            TaskState::InFlight,
            TaskState::Dead,
        ] {
            assert_eq!(state.as_str().parse::<TaskState>().unwrap(), state);
        }
    }

    #[test]
    fn test_lifecycle_success_path() {
        let mut t = task();
        assert_eq!(t.state, TaskState::Created);
        t.mark_queued(1).unwrap();
        assert_eq!(t.sequence, 1);
        t.mark_in_flight().unwrap();
        assert_eq!(t.state, TaskState::InFlight);
    }

    #[test]
    fn test_failure_and_requeue() {
        let mut t = task();
        t.mark_queued(1).unwrap();
        t.mark_in_flight().unwrap();
        t.record_failure(&TransferError::new(ErrorKind::NetworkTimeout, "slow"));
        let later = Utc::now() + chrono::Duration::seconds(5);
        t.requeue(7, Some(later)).unwrap();
        assert_eq!(t.attempts, 1);
        assert_eq!(t.sequence, 7);
        assert_eq!(t.state, TaskState::Queued);
        assert!(!t.is_due(Utc::now()));
        assert!(t.is_due(later));
        assert_eq!(t.last_error.as_ref().map(|e| e.kind), Some(ErrorKind::NetworkTimeout));
    }

    #[test]
    fn test_invalid_transitions() {
        let mut t = task();
        assert!(t.mark_in_flight().is_err());
        assert!(t.mark_dead().is_err());
        t.mark_queued(1).unwrap();
        assert!(t.mark_queued(2).is_err());
        t.mark_in_flight().unwrap();
        t.mark_dead().unwrap();
        assert!(t.is_dead());
        assert!(t.requeue(3, None).is_err());
    }
}
