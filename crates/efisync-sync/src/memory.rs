//! In-memory port adapters
//!
//! Used by the receiver (whose manifest scans need no persistence), by
//! volume identification (volumes are never persisted) and by tests.

use std::collections::HashMap;

use efisync_core::{
    domain::{FileRecord, RecordPath, TaskId, TransferTask},
    ports::{IEventSink, IRecordStore, ITaskStore, RecordMap, SyncEvent},
};
use tokio::sync::Mutex;

/// Record table held in a map, one entry per root key
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    roots: Mutex<HashMap<String, RecordMap>>,
}

impl MemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl IRecordStore for MemoryRecordStore {
    async fn load(&self, root_key: &str) -> anyhow::Result<RecordMap> {
        Ok(self
            .roots
            .lock()
            .await
            .get(root_key)
            .cloned()
            .unwrap_or_default())
    }

    async fn apply(
        &self,
        root_key: &str,
        upserts: &[FileRecord],
        removals: &[RecordPath],
    ) -> anyhow::Result<()> {
        let mut roots = self.roots.lock().await;
        let table = roots.entry(root_key.to_string()).or_default();
        for record in upserts {
            table.insert(record.path.clone(), record.clone());
        }
        for path in removals {
            table.remove(path);
        }
        Ok(())
    }
}

/// Task store held in a map; contents are lost with the process
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<TaskId, TransferTask>>,
}

impl MemoryTaskStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }
}

#[async_trait::async_trait]
impl ITaskStore for MemoryTaskStore {
    async fn upsert(&self, task: &TransferTask) -> anyhow::Result<()> {
        self.tasks.lock().await.insert(task.id, task.clone());
        Ok(())
    }

    async fn remove(&self, id: &TaskId) -> anyhow::Result<()> {
        self.tasks.lock().await.remove(id);
        Ok(())
    }

    async fn load_all(&self) -> anyhow::Result<Vec<TransferTask>> {
        Ok(self.tasks.lock().await.values().cloned().collect())
    }
}

/// Event sink that keeps every event, for assertions
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<SyncEvent>>,
}

impl MemoryEventSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().await.clone()
    }

    /// Events with the given name, in emission order
    pub async fn named(&self, name: &str) -> Vec<SyncEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.name() == name)
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl IEventSink for MemoryEventSink {
    async fn emit(&self, event: &SyncEvent) {
        self.events.lock().await.push(event.clone());
    }
}
