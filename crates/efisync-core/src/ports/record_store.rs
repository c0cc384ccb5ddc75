//! Record store port (driven/secondary port)
//!
//! Persists the Change Detector's last-known FileRecord per path, keyed by
//! a root key (one per scanned tree).

use std::collections::HashMap;

use crate::domain::{FileRecord, RecordPath};

/// Last-known records of one tree
pub type RecordMap = HashMap<RecordPath, FileRecord>;

#[async_trait::async_trait]
pub trait IRecordStore: Send + Sync {
    /// Load every record stored under `root_key`
    async fn load(&self, root_key: &str) -> anyhow::Result<RecordMap>;

    /// Upsert and delete records under `root_key` in one transaction
    async fn apply(
        &self,
        root_key: &str,
        upserts: &[FileRecord],
        removals: &[RecordPath],
    ) -> anyhow::Result<()>;
}
