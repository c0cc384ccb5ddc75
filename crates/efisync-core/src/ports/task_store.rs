//! Task store port (driven/secondary port)
//!
//! The operation queue writes through this port on every mutation so that
//! every un-acked task survives a restart.
//!
//! ## Design Notes
//!
//! - Each call is one atomic write; a crash leaves the last committed state.
//! - `load_all` order is unspecified; the queue sorts by sequence itself.

use crate::domain::{TaskId, TransferTask};

#[async_trait::async_trait]
pub trait ITaskStore: Send + Sync {
    /// Insert or replace the task with the same id
    async fn upsert(&self, task: &TransferTask) -> anyhow::Result<()>;

    /// Delete a task; deleting an unknown id is not an error
    async fn remove(&self, id: &TaskId) -> anyhow::Result<()>;

    /// Every stored task, including dead ones
    async fn load_all(&self) -> anyhow::Result<Vec<TransferTask>>;
}
