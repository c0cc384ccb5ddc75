//! Operation Queue - durable FIFO of transfer tasks
//!
//! Every mutation is written through the [`ITaskStore`] before the in-memory
//! view changes, so an un-acked task always survives a restart. On open,
//! tasks left in flight by a crash are queued again.
//!
//! ## Ordering
//!
//! Tasks are claimed in sequence order. A task whose source path already has
//! a task in flight, or an earlier task that is not yet claimable, is skipped
//! so that work on one path happens strictly in enqueue order while
//! different paths proceed in parallel. Network tasks are held while the
//! endpoint is offline.
//!
//! ## Back-pressure
//!
//! Above `max_depth` the oldest dead tasks are evicted and returned to the
//! caller to be surfaced. Live tasks are never evicted.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use efisync_core::{
    config::{QueueConfig, RetryConfig},
    domain::{ErrorClass, TaskError, TaskId, TaskState, TransferError, TransferTask},
    ports::ITaskStore,
};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::retry::RetryPolicy;
use crate::SyncError;

// ============================================================================
// Settings and results
// ============================================================================

/// Limits applied by the queue
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Attempts after which a failing task becomes dead
    pub max_task_attempts: u32,
    pub max_depth: usize,
    pub dead_task_max_age: Duration,
    /// Spaces out re-queued tasks
    pub backoff: RetryPolicy,
}

impl QueueSettings {
    #[must_use]
    pub fn from_config(queue: &QueueConfig, retry: &RetryConfig) -> Self {
        Self {
            max_task_attempts: queue.max_task_attempts.max(1),
            max_depth: queue.max_depth.max(1),
            dead_task_max_age: queue.dead_task_max_age(),
            backoff: RetryPolicy::from_config(retry),
        }
    }
}

/// Result of [`OperationQueue::enqueue`]
#[derive(Debug, Clone)]
pub struct Enqueued {
    pub id: TaskId,
    /// The task replaced the record of an equivalent queued task
    pub coalesced: bool,
    /// Dead tasks dropped by back-pressure
    pub evicted: Vec<TransferTask>,
}

/// Result of [`OperationQueue::nack`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    /// Back of the queue, not claimable before `next_attempt_at`
    Requeued {
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Attempt ceiling reached or the error was terminal
    Dead { attempts: u32 },
    /// A global error; the task keeps its place for the next cycle
    Held,
    /// A newer version of the same move is already queued
    Superseded,
}

/// Queue depth figures for status snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Live tasks (queued and in flight)
    pub depth: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub dead: usize,
    /// Age of the oldest live task
    pub oldest_age_secs: Option<u64>,
    pub network_online: bool,
}

#[derive(Default)]
struct Inner {
    tasks: BTreeMap<u64, TransferTask>,
    index: HashMap<TaskId, u64>,
    next_seq: u64,
    busy_sources: HashSet<String>,
    network_online: bool,
}

impl Inner {
    fn insert(&mut self, task: TransferTask) {
        self.next_seq = self.next_seq.max(task.sequence + 1);
        self.index.insert(task.id, task.sequence);
        self.tasks.insert(task.sequence, task);
    }

    fn take(&mut self, seq: u64) -> Option<TransferTask> {
        let task = self.tasks.remove(&seq)?;
        self.index.remove(&task.id);
        Some(task)
    }

    fn alloc_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn in_flight(&self, id: &TaskId) -> Result<(u64, TransferTask), SyncError> {
        self.index
            .get(id)
            .and_then(|seq| self.tasks.get(seq).map(|t| (*seq, t)))
            .filter(|(_, t)| t.state == TaskState::InFlight)
            .map(|(seq, t)| (seq, t.clone()))
            .ok_or(SyncError::NotInFlight(*id))
    }
}

// ============================================================================
// OperationQueue
// ============================================================================

pub struct OperationQueue {
    store: Arc<dyn ITaskStore>,
    settings: QueueSettings,
    inner: Mutex<Inner>,
    changed: watch::Sender<u64>,
}

impl OperationQueue {
    /// Load persisted tasks and re-queue any left in flight
    #[instrument(skip_all)]
    pub async fn open(
        store: Arc<dyn ITaskStore>,
        settings: QueueSettings,
    ) -> Result<Self, SyncError> {
        let mut tasks = store.load_all().await?;
        tasks.sort_by_key(|t| t.sequence);

        let mut inner = Inner {
            next_seq: 1,
            ..Inner::default()
        };
        let mut recovered = 0usize;
        for mut task in tasks {
            let mut dirty = false;
            if matches!(task.state, TaskState::InFlight | TaskState::Created) {
                task.state = TaskState::Queued;
                recovered += 1;
                dirty = true;
            }
            if task.sequence == 0 || inner.tasks.contains_key(&task.sequence) {
                task.sequence = inner.alloc_seq();
                dirty = true;
            }
            if dirty {
                store.upsert(&task).await?;
            }
            inner.insert(task);
        }

        info!(
            tasks = inner.tasks.len(),
            recovered, "Operation queue opened"
        );
        let (changed, _) = watch::channel(0);
        Ok(Self {
            store,
            settings,
            inner: Mutex::new(inner),
            changed,
        })
    }

    fn bump(&self) {
        self.changed.send_modify(|generation| *generation += 1);
    }

    /// Receiver that changes whenever the queue does
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    #[must_use]
    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Add a task at the back of the queue
    ///
    /// A queued (not in flight) task for the same source, destination and
    /// kind is updated in place with the newer record instead.
    #[instrument(skip_all, fields(kind = %task.kind, source = %task.source))]
    pub async fn enqueue(&self, mut task: TransferTask) -> Result<Enqueued, SyncError> {
        let mut inner = self.inner.lock().await;

        let existing = inner
            .tasks
            .values()
            .find(|t| t.state == TaskState::Queued && t.coalesce_key() == task.coalesce_key())
            .cloned();
        if let Some(mut existing) = existing {
            existing.record = task.record;
            existing.attempts = 0;
            existing.last_error = None;
            existing.next_attempt_at = None;
            self.store.upsert(&existing).await?;
            let id = existing.id;
            inner.insert(existing);
            drop(inner);
            debug!(task_id = %id, "Coalesced with queued task");
            self.bump();
            return Ok(Enqueued {
                id,
                coalesced: true,
                evicted: Vec::new(),
            });
        }

        let seq = inner.next_seq;
        task.mark_queued(seq)?;
        self.store.upsert(&task).await?;
        let id = task.id;
        inner.insert(task);

        let evicted = self.enforce_depth(&mut inner).await?;
        drop(inner);
        debug!(task_id = %id, sequence = seq, "Task enqueued");
        self.bump();
        Ok(Enqueued {
            id,
            coalesced: false,
            evicted,
        })
    }

    async fn enforce_depth(&self, inner: &mut Inner) -> Result<Vec<TransferTask>, SyncError> {
        let mut evicted = Vec::new();
        while inner.tasks.len() > self.settings.max_depth {
            let Some(seq) = inner
                .tasks
                .iter()
                .find(|(_, t)| t.is_dead())
                .map(|(seq, _)| *seq)
            else {
                warn!(
                    depth = inner.tasks.len(),
                    max_depth = self.settings.max_depth,
                    "Queue above depth ceiling with no dead tasks to evict"
                );
                break;
            };
            if let Some(task) = inner.tasks.get(&seq) {
                self.store.remove(&task.id).await?;
            }
            if let Some(task) = inner.take(seq) {
                error!(
                    task_id = %task.id,
                    path = %task.source,
                    error_kind = ?task.last_error.as_ref().map(|e| e.kind),
                    "Dead task evicted by back-pressure"
                );
                evicted.push(task);
            }
        }
        Ok(evicted)
    }

    /// Claim the next eligible task, marking it in flight
    pub async fn dequeue_next(&self) -> Result<Option<TransferTask>, SyncError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        let chosen = {
            let mut blocked: HashSet<&str> =
                inner.busy_sources.iter().map(String::as_str).collect();
            let mut found = None;
            for (seq, task) in &inner.tasks {
                if task.state != TaskState::Queued || blocked.contains(task.source.as_str()) {
                    continue;
                }
                let online = inner.network_online || !task.kind.is_network();
                if online && task.is_due(now) {
                    found = Some(*seq);
                    break;
                }
                blocked.insert(task.source.as_str());
            }
            found
        };

        let Some(seq) = chosen else {
            return Ok(None);
        };
        let Some(mut task) = inner.tasks.get(&seq).cloned() else {
            return Ok(None);
        };
        task.mark_in_flight()?;
        self.store.upsert(&task).await?;
        inner.busy_sources.insert(task.source.clone());
        inner.insert(task.clone());
        debug!(task_id = %task.id, sequence = seq, source = %task.source, "Task claimed");
        Ok(Some(task))
    }

    /// Remove a successfully completed task
    pub async fn ack(&self, id: &TaskId) -> Result<TransferTask, SyncError> {
        let mut inner = self.inner.lock().await;
        let (seq, task) = inner.in_flight(id)?;
        self.store.remove(id).await?;
        inner.take(seq);
        inner.busy_sources.remove(&task.source);
        drop(inner);
        self.bump();
        Ok(task)
    }

    /// Record a failed claim of `attempts` attempts
    #[instrument(skip(self, error), fields(error_kind = %error.kind))]
    pub async fn nack(
        &self,
        id: &TaskId,
        error: &TransferError,
        attempts: u32,
    ) -> Result<NackOutcome, SyncError> {
        let mut inner = self.inner.lock().await;
        let (seq, mut task) = inner.in_flight(id)?;
        task.last_error = Some(TaskError::from(error));

        let outcome = match error.class() {
            ErrorClass::TerminalGlobal => {
                task.release()?;
                self.store.upsert(&task).await?;
                inner.insert(task.clone());
                NackOutcome::Held
            }
            class => {
                task.attempts += attempts.max(1);
                if class == ErrorClass::TerminalTask
                    || task.attempts >= self.settings.max_task_attempts
                {
                    task.mark_dead()?;
                    self.store.upsert(&task).await?;
                    error!(
                        task_id = %task.id,
                        path = %task.source,
                        attempts = task.attempts,
                        error_kind = %error.kind,
                        error = %error.message,
                        "Task is dead"
                    );
                    let attempts = task.attempts;
                    inner.insert(task.clone());
                    NackOutcome::Dead { attempts }
                } else if inner.tasks.values().any(|t| {
                    t.state == TaskState::Queued && t.coalesce_key() == task.coalesce_key()
                }) {
                    self.store.remove(id).await?;
                    inner.take(seq);
                    NackOutcome::Superseded
                } else {
                    self.requeue(&mut inner, seq, task.clone()).await?
                }
            }
        };
        inner.busy_sources.remove(&task.source);
        drop(inner);
        self.bump();
        Ok(outcome)
    }

    /// Move a failed task and its same-path followers to the back
    async fn requeue(
        &self,
        inner: &mut Inner,
        seq: u64,
        mut task: TransferTask,
    ) -> Result<NackOutcome, SyncError> {
        let next_attempt_at = Utc::now()
            + chrono::Duration::from_std(self.settings.backoff.delay_for(task.attempts))
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let followers: Vec<u64> = inner
            .tasks
            .range(seq + 1..)
            .filter(|(_, t)| t.state == TaskState::Queued && t.source == task.source)
            .map(|(s, _)| *s)
            .collect();

        let new_seq = inner.alloc_seq();
        task.requeue(new_seq, Some(next_attempt_at))?;
        self.store.upsert(&task).await?;
        inner.take(seq);
        let attempts = task.attempts;
        debug!(
            task_id = %task.id,
            attempts,
            sequence = new_seq,
            followers = followers.len(),
            "Task re-queued"
        );
        inner.insert(task);

        for follower_seq in followers {
            if let Some(mut follower) = inner.take(follower_seq) {
                follower.sequence = inner.alloc_seq();
                self.store.upsert(&follower).await?;
                inner.insert(follower);
            }
        }

        Ok(NackOutcome::Requeued {
            attempts,
            next_attempt_at,
        })
    }

    /// Allow or hold network tasks
    pub async fn set_network_online(&self, online: bool) {
        let mut inner = self.inner.lock().await;
        if inner.network_online != online {
            inner.network_online = online;
            drop(inner);
            info!(online, "Network tasks {}", if online { "released" } else { "held" });
            self.bump();
        }
    }

    /// Drop dead tasks that died longer ago than the configured age
    pub async fn purge_expired_dead(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<TransferTask>, SyncError> {
        let max_age = chrono::Duration::from_std(self.settings.dead_task_max_age)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let mut inner = self.inner.lock().await;
        let expired: Vec<u64> = inner
            .tasks
            .iter()
            .filter(|(_, t)| {
                let died_at = t.last_error.as_ref().map_or(t.enqueued_at, |e| e.at);
                t.is_dead() && now - died_at > max_age
            })
            .map(|(seq, _)| *seq)
            .collect();

        let mut purged = Vec::with_capacity(expired.len());
        for seq in expired {
            if let Some(task) = inner.tasks.get(&seq) {
                self.store.remove(&task.id).await?;
            }
            if let Some(task) = inner.take(seq) {
                purged.push(task);
            }
        }
        drop(inner);
        if !purged.is_empty() {
            info!(count = purged.len(), "Expired dead tasks purged");
            self.bump();
        }
        Ok(purged)
    }

    /// Every task in queue order, dead ones included
    pub async fn tasks(&self) -> Vec<TransferTask> {
        self.inner.lock().await.tasks.values().cloned().collect()
    }

    pub async fn dead_tasks(&self) -> Vec<TransferTask> {
        self.inner
            .lock()
            .await
            .tasks
            .values()
            .filter(|t| t.is_dead())
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> QueueStats {
        let now = Utc::now();
        let inner = self.inner.lock().await;
        let mut stats = QueueStats {
            network_online: inner.network_online,
            ..QueueStats::default()
        };
        let mut oldest: Option<DateTime<Utc>> = None;
        for task in inner.tasks.values() {
            match task.state {
                TaskState::Dead => stats.dead += 1,
                TaskState::InFlight => stats.in_flight += 1,
                TaskState::Queued | TaskState::Created => stats.queued += 1,
            }
            if !task.is_dead() {
                oldest = Some(oldest.map_or(task.enqueued_at, |o| o.min(task.enqueued_at)));
            }
        }
        stats.depth = stats.queued + stats.in_flight;
        stats.oldest_age_secs = oldest.map(|o| (now - o).num_seconds().max(0) as u64);
        stats
    }
}
