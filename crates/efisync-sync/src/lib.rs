//! EFISync Sync - resilient synchronization and offline queuing
//!
//! Provides:
//! - Incremental change detection without full re-hashing
//! - Bounded retries with exponential backoff keyed by error kind
//! - Endpoint reachability tracking
//! - A durable FIFO operation queue that holds network work while offline
//! - Verified transfers (temp write, streamed fingerprint, atomic rename)
//! - Removable-media identification and reconciliation against the archive
//!
//! ## Modules
//!
//! - [`detector`] - Change Detector over a source tree
//! - [`retry`] - Retry/Backoff Controller
//! - [`connection`] - Connection Manager and TCP probe
//! - [`queue`] - Operation Queue
//! - [`transfer`] - Transfer Engine and local atomic sink
//! - [`wire`] - Producer/consumer TCP protocol and the receiver server
//! - [`media`] - Removable-Media Reconciler
//! - [`orchestrator`] - Sync Orchestrator

pub mod connection;
pub mod detector;
pub mod events;
pub mod fingerprint;
pub mod media;
pub mod memory;
pub mod orchestrator;
pub mod patterns;
pub mod queue;
pub mod retry;
pub mod transfer;
pub mod wire;

#[cfg(test)]
pub(crate) mod test_support;

use std::path::PathBuf;

use efisync_core::domain::{DomainError, ErrorKind, TaskId, TransferError};
use thiserror::Error;

/// Errors that can occur during synchronization operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// An I/O error occurred during file operations
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// A scanned root directory does not exist or cannot be listed
    #[error("Root unavailable: {}", .0.display())]
    RootUnavailable(PathBuf),

    /// An exclude or extract pattern failed to compile
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    /// The persistence adapter failed
    #[error("Store error: {0:#}")]
    Store(anyhow::Error),

    /// The task is unknown or not in the state the operation requires
    #[error("Task {0} is not in flight")]
    NotInFlight(TaskId),

    /// A classified transfer failure
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// The orchestrator was started twice
    #[error("Already running")]
    AlreadyRunning,

    /// A domain-level error propagated from efisync-core
    #[error("Domain error: {0}")]
    DomainError(#[from] DomainError),
}

impl From<anyhow::Error> for SyncError {
    fn from(err: anyhow::Error) -> Self {
        SyncError::Store(err)
    }
}

impl SyncError {
    /// Error kind used when this error ends up in a cycle result
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::IoError(e) => ErrorKind::from_io(e),
            SyncError::RootUnavailable(_) => ErrorKind::ArchiveUnavailable,
            SyncError::InvalidPattern(_) => ErrorKind::InvalidConfig,
            SyncError::Store(_) => ErrorKind::TransientIo,
            SyncError::Transfer(e) => e.kind,
            SyncError::NotInFlight(_) | SyncError::AlreadyRunning | SyncError::DomainError(_) => {
                ErrorKind::Protocol
            }
        }
    }
}
