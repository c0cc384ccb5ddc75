//! Scripted port implementations shared by unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use efisync_core::{
    domain::{ErrorKind, FileRecord, TransferError, TransferTask},
    ports::{IReachabilityProbe, IRemoteCatalog, ITransferExecutor, TransferOutcome},
};

/// Probe whose answer is flipped by the test
pub struct ScriptedProbe {
    reachable: AtomicBool,
    calls: AtomicU64,
}

impl ScriptedProbe {
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
            calls: AtomicU64::new(0),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl IReachabilityProbe for ScriptedProbe {
    async fn probe(&self, address: &str, _timeout: Duration) -> Result<Duration, TransferError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.reachable.load(Ordering::SeqCst) {
            Ok(Duration::from_millis(5))
        } else {
            Err(TransferError::new(
                ErrorKind::ConnectionRefused,
                format!("{address} refused"),
            ))
        }
    }
}

/// Executor that fails according to a per-destination script and otherwise
/// reports the task's record as delivered
#[derive(Default)]
pub struct ScriptedExecutor {
    script: Mutex<HashMap<String, VecDeque<ErrorKind>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue failures for the next calls targeting `destination`
    pub fn fail(&self, destination: &str, kinds: &[ErrorKind]) {
        self.script
            .lock()
            .unwrap()
            .entry(destination.to_string())
            .or_default()
            .extend(kinds.iter().copied());
    }

    /// Destinations in call order, one entry per attempt
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, destination: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.as_str() == destination)
            .count()
    }
}

#[async_trait::async_trait]
impl ITransferExecutor for ScriptedExecutor {
    async fn transfer(&self, task: &TransferTask) -> Result<TransferOutcome, TransferError> {
        self.calls.lock().unwrap().push(task.destination.clone());
        let failure = self
            .script
            .lock()
            .unwrap()
            .get_mut(&task.destination)
            .and_then(VecDeque::pop_front);
        match failure {
            Some(kind) => Err(TransferError::new(kind, format!("scripted {kind}"))),
            None => Ok(TransferOutcome {
                bytes: task.record.size,
                fingerprint: task.record.fingerprint.clone(),
                skipped: false,
                duration: Duration::from_millis(1),
            }),
        }
    }
}

/// Remote listing set by the test
#[derive(Default)]
pub struct StaticCatalog {
    records: Mutex<HashMap<String, Vec<FileRecord>>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, prefix: &str, records: Vec<FileRecord>) {
        self.records
            .lock()
            .unwrap()
            .insert(prefix.to_string(), records);
    }
}

#[async_trait::async_trait]
impl IRemoteCatalog for StaticCatalog {
    async fn manifest(&self, prefix: &str) -> Result<Vec<FileRecord>, TransferError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(prefix)
            .cloned()
            .unwrap_or_default())
    }
}
