//! Sync Orchestrator - drives scans, queuing, draining and volume sessions
//!
//! ## Cycle
//!
//! ```text
//! IDLE ─→ SCANNING ─→ QUEUING ─→ DRAINING ─→ IDLE
//!   │                                 ▲
//!   └── endpoint UNREACHABLE→REACHABLE ┘  (drain only)
//! ```
//!
//! Each cycle produces one [`SyncResult`]. A global error (archive root
//! inaccessible, invalid configuration) fails the cycle and skips the drain.
//! A task that fails terminally becomes dead and the cycle carries on.
//!
//! ## Run loop
//!
//! One task owns the timers and channels: the scan interval, the probe
//! interval, reachability changes, volume insertions, forced cycles and
//! pause/resume. Draining uses a fixed pool of workers. Stopping cancels the
//! loop; workers finish the transfer they hold and claim nothing new.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use efisync_core::{
    config::{Config, JobDirection, SyncJob, MAX_WORKERS},
    domain::{
        CycleError, CycleTrigger, ErrorKind, SyncResult, TaskKind, TransferTask,
    },
    ports::{IEventSink, IRemoteCatalog, ITransferExecutor, Reachability, SyncEvent},
};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::connection::{ConnectionManager, ConnectionStats};
use crate::detector::{ChangeDetector, ScanOutcome};
use crate::media::MediaReconciler;
use crate::queue::{NackOutcome, OperationQueue, QueueStats};
use crate::retry::RetryPolicy;
use crate::transfer::cleanup_orphans;
use crate::SyncError;

/// Pending volume insertions buffered by the channel
const VOLUME_CHANNEL_CAPACITY: usize = 16;

// ============================================================================
// Phase and status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Scanning,
    Queuing,
    Draining,
    Reconciling,
    Stopped,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Scanning => "scanning",
            Phase::Queuing => "queuing",
            Phase::Draining => "draining",
            Phase::Reconciling => "reconciling",
            Phase::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of the orchestrator for the service host
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub phase: Phase,
    pub paused: bool,
    pub reachability: Reachability,
    pub connection: ConnectionStats,
    pub queue: QueueStats,
    pub last_result: Option<SyncResult>,
    pub next_cycle_at: Option<DateTime<Utc>>,
    pub history_len: usize,
}

struct State {
    phase: Phase,
    paused: bool,
    last_result: Option<SyncResult>,
    history: VecDeque<SyncResult>,
    next_cycle_at: Option<DateTime<Utc>>,
    /// Start time of each job's last clean, committed scan
    watermarks: HashMap<String, DateTime<Utc>>,
}

/// Collaborators wired by the host
pub struct OrchestratorDeps {
    pub config: Config,
    pub queue: Arc<OperationQueue>,
    pub detector: Arc<ChangeDetector>,
    pub connection: Arc<ConnectionManager>,
    pub executor: Arc<dyn ITransferExecutor>,
    pub catalog: Arc<dyn IRemoteCatalog>,
    pub media: Option<Arc<MediaReconciler>>,
    pub events: Arc<dyn IEventSink>,
}

#[derive(Default)]
struct Tally {
    transferred: Vec<u64>,
    errors: Vec<CycleError>,
}

// ============================================================================
// Inner
// ============================================================================

struct Inner {
    config: Config,
    queue: Arc<OperationQueue>,
    detector: Arc<ChangeDetector>,
    connection: Arc<ConnectionManager>,
    executor: Arc<dyn ITransferExecutor>,
    catalog: Arc<dyn IRemoteCatalog>,
    media: Option<Arc<MediaReconciler>>,
    events: Arc<dyn IEventSink>,
    retry: RetryPolicy,
    state: StdMutex<State>,
    cycle_lock: Mutex<()>,
    cancel: StdMutex<CancellationToken>,
    request: Notify,
    wake: Notify,
    volume_tx: mpsc::Sender<PathBuf>,
    volume_rx: Mutex<Option<mpsc::Receiver<PathBuf>>>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: Phase) {
        let mut state = self.state();
        if state.phase != phase {
            debug!(from = %state.phase, to = %phase, "Phase change");
            state.phase = phase;
        }
    }

    fn is_paused(&self) -> bool {
        self.state().paused
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ------------------------------------------------------------------------
    // Cycles
    // ------------------------------------------------------------------------

    #[instrument(skip(self))]
    async fn run_cycle(self: &Arc<Self>, trigger: CycleTrigger) -> SyncResult {
        let _cycle = self.cycle_lock.lock().await;
        let mut result = SyncResult::begin(trigger);
        info!("Sync cycle started");

        self.purge_dead(&mut result).await;

        self.set_phase(Phase::Scanning);
        for job in &self.config.sync.jobs {
            if let Err(e) = self.plan_job(job, &mut result).await {
                let kind = e.kind();
                result.record_error(CycleError {
                    task_id: None,
                    path: Some(job.local_root.display().to_string()),
                    kind,
                    message: e.to_string(),
                });
                if kind.is_global() {
                    error!(job = %job.name, error_kind = %kind, error = %e, "Aborting cycle");
                    break;
                }
                warn!(job = %job.name, error_kind = %kind, error = %e, "Job skipped this cycle");
            }
        }

        if !result.has_global_error() {
            self.drain_into(&mut result).await;
        }
        self.complete(result).await
    }

    async fn drain_cycle(self: &Arc<Self>, trigger: CycleTrigger) -> SyncResult {
        let _cycle = self.cycle_lock.lock().await;
        let mut result = SyncResult::begin(trigger);
        self.drain_into(&mut result).await;
        self.complete(result).await
    }

    async fn complete(&self, mut result: SyncResult) -> SyncResult {
        result.finish();
        {
            let mut state = self.state();
            state.last_result = Some(result.clone());
            state.history.push_back(result.clone());
            let cap = self.config.sync.history_size.max(1);
            while state.history.len() > cap {
                state.history.pop_front();
            }
            if state.phase != Phase::Stopped {
                state.phase = Phase::Idle;
            }
        }
        self.events
            .emit(&SyncEvent::CycleCompleted {
                trigger: result.trigger,
                status: result.status,
                files: result.files_transferred,
                bytes: result.bytes_transferred,
                errors: result.errors.len(),
                duration_ms: result.duration_ms,
            })
            .await;
        result
    }

    /// Scan a job's root from its watermark
    async fn scan_job(&self, job: &SyncJob) -> Result<(ScanOutcome, DateTime<Utc>), SyncError> {
        let started = Utc::now();
        let since = self.state().watermarks.get(&job.name).copied();
        let outcome = self.detector.scan(&job.local_root, since).await?;
        Ok((outcome, started))
    }

    /// Move the job's watermark once `outcome` is committed
    ///
    /// A scan that left files unstable or unreadable keeps the old watermark
    /// so those files are compared in full next time.
    fn advance_watermark(&self, job: &SyncJob, outcome: &ScanOutcome, started: DateTime<Utc>) {
        if outcome.unstable.is_empty() && outcome.unreadable.is_empty() {
            self.state().watermarks.insert(job.name.clone(), started);
        }
    }

    /// Scan one job and queue what it needs
    async fn plan_job(&self, job: &SyncJob, result: &mut SyncResult) -> Result<(), SyncError> {
        match job.direction {
            JobDirection::Push => {
                let (outcome, started) = self.scan_job(job).await?;
                self.set_phase(Phase::Queuing);
                for record in &outcome.changed {
                    let destination = record.path.prefixed(&job.remote_prefix)?;
                    let task = TransferTask::new(
                        TaskKind::Push,
                        record.path.to_path(&job.local_root).to_string_lossy(),
                        destination.as_str(),
                        record.clone(),
                    );
                    self.enqueue(task, result).await?;
                }
                // Only after every change is durably queued
                self.detector.commit(&job.local_root, &outcome).await?;
                self.advance_watermark(job, &outcome, started);
                debug!(job = %job.name, queued = outcome.changed.len(), "Push job planned");
            }
            JobDirection::Pull => {
                let (outcome, started) = self.scan_job(job).await?;
                self.detector.commit(&job.local_root, &outcome).await?;
                self.advance_watermark(job, &outcome, started);
                if !self.connection.is_reachable().await {
                    debug!(job = %job.name, "Endpoint unreachable, remote listing deferred");
                    return Ok(());
                }
                let remote = self.catalog.manifest(&job.remote_prefix).await?;
                let local = self.detector.known(&job.local_root).await?;
                self.set_phase(Phase::Queuing);
                let mut queued = 0usize;
                for record in remote {
                    if local
                        .get(&record.path)
                        .is_some_and(|l| l.same_content(&record))
                    {
                        continue;
                    }
                    let source = record.path.prefixed(&job.remote_prefix)?;
                    let destination = record.path.to_path(&job.local_root);
                    let task = TransferTask::new(
                        TaskKind::Pull,
                        source.as_str(),
                        destination.to_string_lossy(),
                        record,
                    );
                    self.enqueue(task, result).await?;
                    queued += 1;
                }
                debug!(job = %job.name, queued, "Pull job planned");
            }
        }
        Ok(())
    }

    async fn enqueue(&self, task: TransferTask, result: &mut SyncResult) -> Result<(), SyncError> {
        let enqueued = self.queue.enqueue(task).await?;
        for evicted in enqueued.evicted {
            self.surface_dropped(evicted, "dead task evicted by back-pressure", result)
                .await;
        }
        Ok(())
    }

    async fn purge_dead(&self, result: &mut SyncResult) {
        match self.queue.purge_expired_dead(Utc::now()).await {
            Ok(purged) => {
                for task in purged {
                    self.surface_dropped(task, "dead task expired", result).await;
                }
            }
            Err(e) => warn!(error = %e, "Could not purge expired dead tasks"),
        }
    }

    async fn surface_dropped(&self, task: TransferTask, reason: &str, result: &mut SyncResult) {
        let last_kind = task.last_error.as_ref().map(|e| e.kind);
        let path = task.record.path.to_string();
        result.record_error(CycleError {
            task_id: Some(task.id),
            path: Some(path.clone()),
            kind: last_kind.unwrap_or(ErrorKind::Evicted),
            message: reason.to_string(),
        });
        self.events
            .emit(&SyncEvent::TaskEvicted {
                task_id: task.id,
                path,
                error_kind: last_kind,
            })
            .await;
    }

    // ------------------------------------------------------------------------
    // Draining
    // ------------------------------------------------------------------------

    async fn drain_into(self: &Arc<Self>, result: &mut SyncResult) {
        self.set_phase(Phase::Draining);
        let online = self.connection.is_reachable().await;
        self.queue.set_network_online(online).await;

        let stop = self.cancel_token().child_token();
        let workers = self.config.transfer.workers.clamp(1, MAX_WORKERS);
        let mut set = JoinSet::new();
        for worker in 0..workers {
            let this = Arc::clone(self);
            let stop = stop.clone();
            set.spawn(async move { this.worker(worker, stop).await });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(tally) => {
                    for bytes in tally.transferred {
                        result.record_transfer(bytes);
                    }
                    for e in tally.errors {
                        result.record_error(e);
                    }
                }
                Err(e) => error!(error = %e, "Drain worker panicked"),
            }
        }
    }

    async fn worker(&self, worker: usize, stop: CancellationToken) -> Tally {
        let mut tally = Tally::default();
        while !stop.is_cancelled() {
            let task = match self.queue.dequeue_next().await {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(e) => {
                    error!(worker, error = %e, "Could not claim a task");
                    tally.errors.push(CycleError {
                        task_id: None,
                        path: None,
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                    break;
                }
            };
            self.process(task, &stop, &mut tally).await;
        }
        debug!(worker, "Drain worker finished");
        tally
    }

    async fn process(&self, task: TransferTask, stop: &CancellationToken, tally: &mut Tally) {
        let ceiling = self.queue.settings().max_task_attempts;
        let budget = self
            .retry
            .max_attempts()
            .min(ceiling.saturating_sub(task.attempts))
            .max(1);
        let started = Instant::now();
        let executor = &self.executor;
        let claimed = &task;
        let outcome = self
            .retry
            .execute(task.kind.as_str(), budget, move |_| async move {
                executor.transfer(claimed).await
            })
            .await;
        let path = task.record.path.to_string();

        match outcome.result {
            Ok(done) => {
                if let Err(e) = self.queue.ack(&task.id).await {
                    error!(task_id = %task.id, error = %e, "Could not acknowledge task");
                    tally.errors.push(CycleError {
                        task_id: Some(task.id),
                        path: Some(path),
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                    return;
                }
                tally.transferred.push(done.bytes);
                self.events
                    .emit(&SyncEvent::TaskSucceeded {
                        task_id: task.id,
                        kind: task.kind,
                        path,
                        bytes: done.bytes,
                        attempts: task.attempts + outcome.attempts,
                        duration_ms: started.elapsed().as_millis() as u64,
                    })
                    .await;
            }
            Err(err) => {
                let (attempts, dead) = match self.queue.nack(&task.id, &err, outcome.attempts).await
                {
                    Ok(NackOutcome::Requeued { attempts, .. }) => (attempts, false),
                    Ok(NackOutcome::Dead { attempts }) => (attempts, true),
                    Ok(NackOutcome::Held) => {
                        stop.cancel();
                        (task.attempts, false)
                    }
                    Ok(NackOutcome::Superseded) => {
                        debug!(task_id = %task.id, "Failed task superseded by a newer version");
                        return;
                    }
                    Err(e) => {
                        error!(task_id = %task.id, error = %e, "Could not record task failure");
                        (task.attempts + outcome.attempts, false)
                    }
                };
                tally.errors.push(CycleError {
                    task_id: Some(task.id),
                    path: Some(path.clone()),
                    kind: err.kind,
                    message: err.message.clone(),
                });
                self.events
                    .emit(&SyncEvent::TaskFailed {
                        task_id: task.id,
                        kind: task.kind,
                        path,
                        error_kind: err.kind,
                        message: err.message,
                        attempts,
                        dead,
                    })
                    .await;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------------

    async fn cleanup_temp_files(&self) {
        let age = self.config.transfer.orphan_temp_age();
        let mut roots: Vec<PathBuf> = self
            .config
            .sync
            .jobs
            .iter()
            .map(|j| j.local_root.clone())
            .collect();
        if let Some(media) = &self.media {
            roots.push(media.archive_root().to_path_buf());
        }
        for root in roots {
            if tokio::fs::metadata(&root).await.is_err() {
                continue;
            }
            if let Err(e) = cleanup_orphans(&root, age).await {
                warn!(root = %root.display(), error = %e, "Temp file cleanup failed");
            }
        }
    }

    fn schedule_next(&self) {
        let interval = chrono::Duration::from_std(self.config.sync.interval())
            .unwrap_or_else(|_| chrono::Duration::seconds(1800));
        self.state().next_cycle_at = Some(Utc::now() + interval);
    }

    async fn handle_volume(&self, mount: PathBuf) {
        let Some(media) = &self.media else {
            debug!(mount = %mount.display(), "Media reconciliation disabled, ignoring volume");
            return;
        };
        self.set_phase(Phase::Reconciling);
        match media.handle_insertion(&mount).await {
            Ok(Some(_)) => {}
            Ok(None) => info!(mount = %mount.display(), "Inserted volume is not managed"),
            Err(e) => error!(
                mount = %mount.display(),
                error_kind = %e.kind(),
                error = %e,
                "Volume reconciliation failed"
            ),
        }
        self.set_phase(Phase::Idle);
    }

    async fn on_reachability(self: &Arc<Self>, from: Reachability, to: Reachability) {
        self.events
            .emit(&SyncEvent::ReachabilityChanged {
                endpoint: self.connection.endpoint().to_string(),
                from,
                to,
            })
            .await;
        let online = to == Reachability::Reachable;
        self.queue.set_network_online(online).await;
        if online && !self.is_paused() {
            info!(from = %from, "Endpoint back, draining queue");
            self.drain_cycle(CycleTrigger::Reconnected).await;
        }
    }

    async fn run_loop(
        self: Arc<Self>,
        cancel: CancellationToken,
        mut volumes: mpsc::Receiver<PathBuf>,
    ) -> mpsc::Receiver<PathBuf> {
        let mut cycles = tokio::time::interval(self.config.sync.interval());
        cycles.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut probes = tokio::time::interval(self.config.endpoint.probe_interval());
        probes.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut reachability = self.connection.subscribe();
        let mut last_reachability = *reachability.borrow_and_update();
        let mut pending: VecDeque<PathBuf> = VecDeque::new();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = reachability.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let to = *reachability.borrow_and_update();
                    if to != last_reachability {
                        let from = std::mem::replace(&mut last_reachability, to);
                        self.on_reachability(from, to).await;
                    }
                }
                _ = self.request.notified() => {
                    self.run_cycle(CycleTrigger::Requested).await;
                }
                _ = cycles.tick() => {
                    self.schedule_next();
                    if self.is_paused() {
                        debug!("Paused, scheduled cycle skipped");
                    } else {
                        self.run_cycle(CycleTrigger::Scheduled).await;
                    }
                }
                _ = probes.tick() => {
                    match self.connection.probe().await {
                        Ok(latency) => {
                            debug!(latency_ms = latency.as_millis() as u64, "Probe succeeded");
                        }
                        Err(e) => {
                            debug!(error_kind = %e.kind, error = %e.message, "Probe failed");
                        }
                    }
                }
                Some(mount) = volumes.recv() => {
                    if self.is_paused() {
                        debug!(mount = %mount.display(), "Paused, volume deferred");
                        pending.push_back(mount);
                    } else {
                        self.handle_volume(mount).await;
                    }
                }
                _ = self.wake.notified() => {
                    while !self.is_paused() {
                        let Some(mount) = pending.pop_front() else { break };
                        self.handle_volume(mount).await;
                    }
                }
            }
        }
        volumes
    }
}

// ============================================================================
// SyncOrchestrator
// ============================================================================

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<mpsc::Receiver<PathBuf>>,
}

/// Service handle of the sync core
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

impl SyncOrchestrator {
    #[must_use]
    pub fn new(deps: OrchestratorDeps) -> Self {
        let (volume_tx, volume_rx) = mpsc::channel(VOLUME_CHANNEL_CAPACITY);
        let retry = RetryPolicy::from_config(&deps.config.retry);
        let history = VecDeque::with_capacity(deps.config.sync.history_size.max(1));
        Self {
            inner: Arc::new(Inner {
                config: deps.config,
                queue: deps.queue,
                detector: deps.detector,
                connection: deps.connection,
                executor: deps.executor,
                catalog: deps.catalog,
                media: deps.media,
                events: deps.events,
                retry,
                state: StdMutex::new(State {
                    phase: Phase::Idle,
                    paused: false,
                    last_result: None,
                    history,
                    next_cycle_at: None,
                    watermarks: HashMap::new(),
                }),
                cycle_lock: Mutex::new(()),
                cancel: StdMutex::new(CancellationToken::new()),
                request: Notify::new(),
                wake: Notify::new(),
                volume_tx,
                volume_rx: Mutex::new(Some(volume_rx)),
            }),
            running: Mutex::new(None),
        }
    }

    /// Spawn the run loop
    ///
    /// Removes orphaned temp files first. The first cycle runs immediately.
    pub async fn start(&self) -> Result<(), SyncError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(SyncError::AlreadyRunning);
        }
        let Some(volumes) = self.inner.volume_rx.lock().await.take() else {
            return Err(SyncError::AlreadyRunning);
        };

        self.inner.cleanup_temp_files().await;
        let cancel = CancellationToken::new();
        *self
            .inner
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = cancel.clone();
        self.inner.set_phase(Phase::Idle);

        let handle = tokio::spawn(Arc::clone(&self.inner).run_loop(cancel.clone(), volumes));
        *running = Some(Running { cancel, handle });
        info!(
            jobs = self.inner.config.sync.jobs.len(),
            interval_secs = self.inner.config.sync.interval_secs,
            endpoint = %self.inner.connection.endpoint(),
            "Sync orchestrator started"
        );
        Ok(())
    }

    /// Stop the run loop; transfers in flight finish first
    pub async fn stop(&self) {
        let Some(Running { cancel, handle }) = self.running.lock().await.take() else {
            return;
        };
        cancel.cancel();
        match handle.await {
            Ok(volumes) => *self.inner.volume_rx.lock().await = Some(volumes),
            Err(e) => error!(error = %e, "Run loop ended abnormally"),
        }
        {
            let mut state = self.inner.state();
            state.phase = Phase::Stopped;
            state.next_cycle_at = None;
        }
        info!("Sync orchestrator stopped");
    }

    pub async fn status_snapshot(&self) -> StatusSnapshot {
        let queue = self.inner.queue.stats().await;
        let connection = self.inner.connection.stats();
        let state = self.inner.state();
        StatusSnapshot {
            phase: state.phase,
            paused: state.paused,
            reachability: connection.state,
            connection,
            queue,
            last_result: state.last_result.clone(),
            next_cycle_at: state.next_cycle_at,
            history_len: state.history.len(),
        }
    }

    /// Run a cycle as soon as the loop is free, even while paused
    pub fn request_cycle(&self) {
        self.inner.request.notify_one();
    }

    /// Hold scheduled cycles, reconnect drains and volume sessions
    pub fn pause(&self) {
        self.inner.state().paused = true;
        info!("Sync paused");
    }

    pub fn resume(&self) {
        self.inner.state().paused = false;
        self.inner.wake.notify_one();
        info!("Sync resumed");
    }

    /// Channel on which the host reports mounted volumes
    #[must_use]
    pub fn volume_sender(&self) -> mpsc::Sender<PathBuf> {
        self.inner.volume_tx.clone()
    }

    /// Results of recent cycles, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<SyncResult> {
        self.inner.state().history.iter().cloned().collect()
    }

    /// Run one full cycle now
    pub async fn run_cycle(&self, trigger: CycleTrigger) -> SyncResult {
        self.inner.run_cycle(trigger).await
    }

    /// Drain the queue without scanning
    pub async fn drain_now(&self) -> SyncResult {
        self.inner.drain_cycle(CycleTrigger::Reconnected).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryEventSink, MemoryRecordStore, MemoryTaskStore};
    use crate::queue::QueueSettings;
    use crate::test_support::{ScriptedExecutor, ScriptedProbe, StaticCatalog};
    use efisync_core::config::ConfigBuilder;
    use efisync_core::domain::{CycleStatus, FileRecord, RecordPath, TransferError};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        root: PathBuf,
        orch: SyncOrchestrator,
        probe: Arc<ScriptedProbe>,
        executor: Arc<ScriptedExecutor>,
        catalog: Arc<StaticCatalog>,
        events: Arc<MemoryEventSink>,
        connection: Arc<ConnectionManager>,
        queue: Arc<OperationQueue>,
    }

    fn push_job(root: &Path) -> SyncJob {
        SyncJob {
            name: "logs".into(),
            direction: JobDirection::Push,
            local_root: root.to_path_buf(),
            remote_prefix: "logs".into(),
        }
    }

    async fn harness_with(
        reachable: bool,
        configure: impl FnOnce(ConfigBuilder, &Path) -> ConfigBuilder,
    ) -> Harness {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("logs");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("a.log"), vec![b'a'; 10]).unwrap();
        std::fs::write(root.join("b.log"), vec![b'b'; 20]).unwrap();
        std::fs::write(root.join("c.log"), vec![b'c'; 5]).unwrap();

        let base = ConfigBuilder::new()
            .sync_stability_delay_ms(0)
            .retry_base_delay_ms(1)
            .transfer_workers(1)
            .endpoint_probe_ttl_secs(0)
            .queue_max_task_attempts(5);
        let config = configure(base, &root).build();

        let queue = Arc::new(
            OperationQueue::open(
                Arc::new(MemoryTaskStore::new()),
                QueueSettings::from_config(&config.queue, &config.retry),
            )
            .await
            .unwrap(),
        );
        let detector = Arc::new(
            ChangeDetector::new(
                Arc::new(MemoryRecordStore::new()),
                &config.sync.exclude,
                config.sync.stability_delay(),
            )
            .unwrap(),
        );
        let probe = Arc::new(ScriptedProbe::new(reachable));
        let connection = Arc::new(ConnectionManager::new(&config.endpoint, probe.clone()));
        let executor = Arc::new(ScriptedExecutor::new());
        let catalog = Arc::new(StaticCatalog::new());
        let events = Arc::new(MemoryEventSink::new());

        let orch = SyncOrchestrator::new(OrchestratorDeps {
            config,
            queue: queue.clone(),
            detector,
            connection: connection.clone(),
            executor: executor.clone(),
            catalog: catalog.clone(),
            media: None,
            events: events.clone(),
        });
        Harness {
            _dir: dir,
            root,
            orch,
            probe,
            executor,
            catalog,
            events,
            connection,
            queue,
        }
    }

    async fn harness(reachable: bool) -> Harness {
        harness_with(reachable, |b, root| b.sync_job(push_job(root))).await
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_second_scan_starts_from_watermark() {
        let h = harness(true).await;
        let first = h.orch.run_cycle(CycleTrigger::Requested).await;
        assert_eq!(first.files_transferred, 3);
        assert!(h.orch.inner.state().watermarks.contains_key("logs"));

        // Rewritten with an mtime before the watermark: not compared
        std::fs::write(h.root.join("a.log"), vec![b'z'; 10]).unwrap();
        std::fs::File::options()
            .write(true)
            .open(h.root.join("a.log"))
            .unwrap()
            .set_modified(std::time::SystemTime::now() - Duration::from_secs(3600))
            .unwrap();
        // Modified after the watermark: picked up
        std::fs::write(h.root.join("b.log"), vec![b'y'; 20]).unwrap();

        let second = h.orch.run_cycle(CycleTrigger::Requested).await;
        assert_eq!(second.files_transferred, 1);
        assert_eq!(h.executor.calls().last().map(String::as_str), Some("logs/b.log"));
    }

    #[tokio::test]
    async fn test_dropped_task_keeps_its_dead_error() {
        let h = harness(true).await;
        let record = FileRecord::new(
            RecordPath::new("a.log").unwrap(),
            10,
            crate::fingerprint::hash_bytes(b"a"),
            Utc::now(),
        );
        let bare = TransferTask::new(TaskKind::Push, "/data/a.log", "logs/a.log", record.clone());
        let mut failed = TransferTask::new(TaskKind::Push, "/data/a.log", "logs/a.log", record);
        failed.record_failure(&TransferError::new(ErrorKind::DestinationFull, "disk full"));

        let mut result = SyncResult::begin(CycleTrigger::Scheduled);
        h.orch.inner.surface_dropped(bare, "dead task expired", &mut result).await;
        h.orch.inner.surface_dropped(failed, "dead task expired", &mut result).await;

        assert_eq!(result.errors[0].kind, ErrorKind::Evicted);
        assert_eq!(result.errors[1].kind, ErrorKind::DestinationFull);
        assert_eq!(h.events.named("task_evicted").await.len(), 2);
    }

    #[tokio::test]
    async fn test_offline_tasks_wait_then_drain_in_order() {
        let h = harness(false).await;

        let first = h.orch.run_cycle(CycleTrigger::Scheduled).await;
        assert_eq!(first.status, CycleStatus::Success);
        assert!(h.executor.calls().is_empty());
        assert_eq!(h.queue.stats().await.depth, 3);

        h.probe.set_reachable(true);
        let drained = h.orch.drain_now().await;
        assert_eq!(drained.status, CycleStatus::Success);
        assert_eq!(drained.files_transferred, 3);
        assert_eq!(drained.bytes_transferred, 35);
        assert_eq!(
            h.executor.calls(),
            vec!["logs/a.log", "logs/b.log", "logs/c.log"]
        );
        assert_eq!(h.queue.stats().await.depth, 0);
    }

    #[tokio::test]
    async fn test_retryable_failures_then_success() {
        let h = harness(true).await;
        h.executor.fail(
            "logs/a.log",
            &[ErrorKind::NetworkTimeout, ErrorKind::NetworkTimeout],
        );

        let result = h.orch.run_cycle(CycleTrigger::Scheduled).await;
        assert_eq!(result.status, CycleStatus::Success);
        assert_eq!(result.files_transferred, 3);
        assert_eq!(h.executor.calls_for("logs/a.log"), 3);

        let succeeded = h.events.named("task_succeeded").await;
        let attempts_for_a = succeeded.iter().find_map(|e| match e {
            SyncEvent::TaskSucceeded { path, attempts, .. } if path == "a.log" => Some(*attempts),
            _ => None,
        });
        assert_eq!(attempts_for_a, Some(3));
    }

    #[tokio::test]
    async fn test_terminal_failure_is_dead_and_cycle_continues() {
        let h = harness(true).await;
        h.executor.fail("logs/a.log", &[ErrorKind::DestinationFull]);

        let result = h.orch.run_cycle(CycleTrigger::Scheduled).await;
        assert_eq!(result.status, CycleStatus::Partial);
        assert_eq!(result.files_transferred, 2);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].kind, ErrorKind::DestinationFull);
        assert_eq!(h.executor.calls_for("logs/a.log"), 1);

        let dead = h.queue.dead_tasks().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 1);
        let failed = h.events.named("task_failed").await;
        assert!(matches!(
            failed.as_slice(),
            [SyncEvent::TaskFailed { dead: true, attempts: 1, .. }]
        ));
    }

    #[tokio::test]
    async fn test_ceiling_spans_cycles() {
        let h = harness_with(true, |b, root| {
            b.sync_job(push_job(root))
                .retry_max_attempts(3)
                .retry_base_delay_ms(20)
        })
        .await;
        h.executor.fail("logs/a.log", &[ErrorKind::ConnectionLost; 10]);

        let first = h.orch.run_cycle(CycleTrigger::Scheduled).await;
        assert_eq!(first.status, CycleStatus::Partial);
        assert_eq!(h.executor.calls_for("logs/a.log"), 3);
        assert!(h.queue.dead_tasks().await.is_empty());

        // Let the re-queue backoff pass
        tokio::time::sleep(Duration::from_millis(300)).await;
        h.orch.run_cycle(CycleTrigger::Scheduled).await;
        assert_eq!(h.executor.calls_for("logs/a.log"), 5);
        assert_eq!(h.queue.dead_tasks().await.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_root_fails_without_drain() {
        let h = harness(true).await;
        std::fs::remove_dir_all(&h.root).unwrap();

        let result = h.orch.run_cycle(CycleTrigger::Requested).await;
        assert_eq!(result.status, CycleStatus::Failed);
        assert_eq!(result.errors[0].kind, ErrorKind::ArchiveUnavailable);
        assert!(h.executor.calls().is_empty());
        assert_eq!(h.orch.history().len(), 1);
    }

    #[tokio::test]
    async fn test_second_cycle_queues_nothing() {
        let h = harness(true).await;
        h.orch.run_cycle(CycleTrigger::Scheduled).await;
        let second = h.orch.run_cycle(CycleTrigger::Scheduled).await;
        assert_eq!(second.files_transferred, 0);
        assert_eq!(h.executor.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_pull_job_fetches_missing_files() {
        let h = harness_with(true, |b, root| {
            b.sync_job(SyncJob {
                name: "charts".into(),
                direction: JobDirection::Pull,
                local_root: root.to_path_buf(),
                remote_prefix: "charts".into(),
            })
        })
        .await;
        let local_a = crate::fingerprint::hash_bytes(&[b'a'; 10]);
        h.catalog.set(
            "charts",
            vec![
                FileRecord::new(RecordPath::new("a.log").unwrap(), 10, local_a, Utc::now()),
                FileRecord::new(
                    RecordPath::new("KPAO.bin").unwrap(),
                    4,
                    crate::fingerprint::hash_bytes(b"kpao"),
                    Utc::now(),
                ),
            ],
        );

        let result = h.orch.run_cycle(CycleTrigger::Scheduled).await;
        assert_eq!(result.status, CycleStatus::Success);
        let expected = h.root.join("KPAO.bin").to_string_lossy().into_owned();
        assert_eq!(h.executor.calls(), vec![expected]);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let h = harness_with(true, |b, root| b.sync_job(push_job(root)).sync_history_size(2)).await;
        for _ in 0..4 {
            h.orch.run_cycle(CycleTrigger::Requested).await;
        }
        assert_eq!(h.orch.history().len(), 2);
        assert_eq!(h.events.named("cycle_completed").await.len(), 4);
    }

    #[tokio::test]
    async fn test_run_loop_drains_on_reconnect() {
        let h = harness(false).await;
        h.orch.start().await.unwrap();
        assert!(matches!(h.orch.start().await, Err(SyncError::AlreadyRunning)));

        wait_for(|| h.orch.history().len() == 1).await;
        assert!(h.executor.calls().is_empty());

        h.probe.set_reachable(true);
        let _ = h.connection.probe().await;
        wait_for(|| h.executor.calls().len() == 3).await;
        assert_eq!(
            h.executor.calls(),
            vec!["logs/a.log", "logs/b.log", "logs/c.log"]
        );

        h.orch.stop().await;
        let status = h.orch.status_snapshot().await;
        assert_eq!(status.phase, Phase::Stopped);
        assert_eq!(status.reachability, Reachability::Reachable);
        assert_eq!(status.queue.depth, 0);
        assert!(!h.events.named("reachability_changed").await.is_empty());
    }

    #[tokio::test]
    async fn test_run_loop_probes_on_its_own_schedule() {
        let h = harness_with(false, |b, root| {
            b.sync_job(push_job(root)).endpoint_probe_interval_secs(1)
        })
        .await;
        h.orch.start().await.unwrap();
        wait_for(|| h.orch.history().len() == 1).await;
        let before = h.probe.calls();

        // No outside probe: the loop's timer notices the endpoint is back
        h.probe.set_reachable(true);
        wait_for(|| h.executor.calls().len() == 3).await;
        assert!(h.probe.calls() > before);
        assert_eq!(
            h.orch.status_snapshot().await.reachability,
            Reachability::Reachable
        );
        h.orch.stop().await;
    }

    #[tokio::test]
    async fn test_pause_skips_scheduled_cycles() {
        let h = harness(true).await;
        h.orch.pause();
        h.orch.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.orch.history().is_empty());
        assert!(h.orch.status_snapshot().await.paused);

        h.orch.resume();
        h.orch.request_cycle();
        wait_for(|| h.orch.history().len() == 1).await;
        assert_eq!(h.executor.calls().len(), 3);
        h.orch.stop().await;

        // Restartable after stop
        h.orch.start().await.unwrap();
        h.orch.stop().await;
    }
}
