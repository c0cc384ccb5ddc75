//! Transfer executor port
//!
//! Performs one verified transfer. Errors are returned as classified
//! [`TransferError`] values rather than `anyhow` because the queue's
//! handling of a failure depends on its kind.

use std::time::Duration;

use crate::domain::{FileRecord, Fingerprint, TransferError, TransferTask};

/// What a successful transfer delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Bytes written at the destination (0 when skipped)
    pub bytes: u64,
    /// Fingerprint verified at the destination
    pub fingerprint: Fingerprint,
    /// The destination already held identical content
    pub skipped: bool,
    pub duration: Duration,
}

#[async_trait::async_trait]
pub trait ITransferExecutor: Send + Sync {
    /// Move the task's content; `Ok` only when the destination fingerprint
    /// equals the source fingerprint
    async fn transfer(&self, task: &TransferTask) -> Result<TransferOutcome, TransferError>;
}

/// Listing of the files the remote endpoint holds under a prefix
#[async_trait::async_trait]
pub trait IRemoteCatalog: Send + Sync {
    /// Records relative to `prefix`
    async fn manifest(&self, prefix: &str) -> Result<Vec<FileRecord>, TransferError>;
}
