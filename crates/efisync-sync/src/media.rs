//! Removable-Media Reconciler
//!
//! ## Flow
//!
//! ```text
//! mount path ─→ identify (markers) ─→ ManagedVolume
//!                                        │
//!                                        ▼
//!                 reconcile against the archive ─→ ReconcilePlan
//!                                                   │ extract  (device files → archive, delete source)
//!                                                   │ inject   (archive files → volume)
//!                                                   │ unchanged
//!                                                   ▼
//!                 execute: extracts, free-space pre-flight, injects
//! ```
//!
//! Identification is by marker files only, never by label or mount point.
//! A session lock gives one reconciliation exclusive use of the volume. If
//! the volume disappears mid-session the in-flight task is retried and the
//! rest of the plan is abandoned.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use efisync_core::{
    config::MediaConfig,
    domain::{
        CycleError, ErrorKind, FileRecord, ManagedVolume, RecordPath, TaskKind, TransferError,
        TransferTask, VolumeId,
    },
    ports::{IEventSink, IRecordStore, ITransferExecutor, SyncEvent, TransferOutcome},
};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::detector::ChangeDetector;
use crate::fingerprint::{hash_bytes, hash_file};
use crate::memory::MemoryRecordStore;
use crate::patterns::{suffixed, ExtractKind, PatternCatalogue};
use crate::retry::RetryPolicy;
use crate::SyncError;

/// Marker whose first non-empty line names the volume
pub const ID_FILE: &str = "EFIS_DRIVE.txt";

// ============================================================================
// Free space
// ============================================================================

/// Capacity queries for a mounted volume
pub trait VolumeSpace: Send + Sync {
    fn free_bytes(&self, path: &Path) -> std::io::Result<u64>;
    fn capacity_bytes(&self, path: &Path) -> std::io::Result<u64>;
}

/// Filesystem statistics via `fs2`
#[derive(Debug, Clone, Copy, Default)]
pub struct Fs2Space;

impl VolumeSpace for Fs2Space {
    fn free_bytes(&self, path: &Path) -> std::io::Result<u64> {
        fs2::available_space(path)
    }

    fn capacity_bytes(&self, path: &Path) -> std::io::Result<u64> {
        fs2::total_space(path)
    }
}

/// Fixed figures, for volumes whose size is known up front
#[derive(Debug, Clone, Copy)]
pub struct FixedSpace {
    pub free: u64,
    pub capacity: u64,
}

impl VolumeSpace for FixedSpace {
    fn free_bytes(&self, _path: &Path) -> std::io::Result<u64> {
        Ok(self.free)
    }

    fn capacity_bytes(&self, _path: &Path) -> std::io::Result<u64> {
        Ok(self.capacity)
    }
}

// ============================================================================
// Plan and report
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractAction {
    /// Copy into the archive, then delete the source
    Copy,
    /// The archive already holds identical content; only delete the source
    DeleteOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractItem {
    /// Record on the volume
    pub source: FileRecord,
    pub kind: ExtractKind,
    /// Path relative to the archive root
    pub target: RecordPath,
    pub action: ExtractAction,
}

/// What a reconciliation will do; the three sets are disjoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub volume_id: VolumeId,
    pub extract: Vec<ExtractItem>,
    /// Archive records (relative to the inject directory) to copy on
    pub inject: Vec<FileRecord>,
    pub unchanged: Vec<RecordPath>,
    /// Bytes the injects need on the volume
    pub required_bytes: u64,
}

impl ReconcilePlan {
    /// True when nothing would be written or removed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extract.is_empty() && self.inject.is_empty()
    }
}

/// What a session did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub volume_id: VolumeId,
    pub mount_path: PathBuf,
    pub extracted: usize,
    pub injected: usize,
    pub unchanged: usize,
    pub bytes: u64,
    pub errors: Vec<CycleError>,
    /// The volume went away and the rest of the plan was abandoned
    pub aborted: bool,
    pub duration: Duration,
}

// ============================================================================
// MediaReconciler
// ============================================================================

/// Collaborators of a [`MediaReconciler`]
pub struct MediaDeps {
    /// Last-known records of the archive's inject directory
    pub records: Arc<dyn IRecordStore>,
    pub executor: Arc<dyn ITransferExecutor>,
    pub space: Arc<dyn VolumeSpace>,
    pub events: Arc<dyn IEventSink>,
}

pub struct MediaReconciler {
    config: MediaConfig,
    exclude: Vec<String>,
    patterns: PatternCatalogue,
    archive: ChangeDetector,
    executor: Arc<dyn ITransferExecutor>,
    space: Arc<dyn VolumeSpace>,
    events: Arc<dyn IEventSink>,
    retry: RetryPolicy,
    session: Mutex<()>,
}

impl MediaReconciler {
    pub fn new(
        config: &MediaConfig,
        exclude: &[String],
        retry: RetryPolicy,
        deps: MediaDeps,
    ) -> Result<Self, SyncError> {
        Ok(Self {
            config: config.clone(),
            exclude: exclude.to_vec(),
            patterns: PatternCatalogue::new(config)?,
            archive: ChangeDetector::new(deps.records, exclude, Duration::ZERO)?,
            executor: deps.executor,
            space: deps.space,
            events: deps.events,
            retry,
            session: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn archive_root(&self) -> &Path {
        &self.config.archive_root
    }

    fn inject_root(&self) -> PathBuf {
        self.config.archive_root.join(&self.config.inject_dir)
    }

    /// Identify the volume mounted at `mount_path`
    ///
    /// Returns `None` when fewer than the configured minimum of markers are
    /// present.
    #[instrument(skip(self), fields(mount = %mount_path.display()))]
    pub async fn identify(&self, mount_path: &Path) -> Result<Option<ManagedVolume>, SyncError> {
        match tokio::fs::metadata(mount_path).await {
            Ok(m) if m.is_dir() => {}
            _ => {
                warn!("Mount path is not a directory");
                return Ok(None);
            }
        }

        let mut markers = Vec::new();
        for marker in &self.config.markers {
            if tokio::fs::metadata(mount_path.join(marker)).await.is_ok() {
                markers.push(marker.clone());
            }
        }
        if markers.len() < self.config.min_markers {
            debug!(found = markers.len(), "Volume is not managed");
            return Ok(None);
        }

        let capacity_bytes = self.space.capacity_bytes(mount_path)?;
        let free_bytes = self.space.free_bytes(mount_path)?;
        let id = self.volume_id(mount_path, &markers, capacity_bytes).await?;

        let scanner = ChangeDetector::new(
            Arc::new(MemoryRecordStore::new()),
            &self.exclude,
            Duration::ZERO,
        )?;
        let mut files = scanner.scan(mount_path, None).await?.changed;
        files.sort_by(|a, b| a.path.cmp(&b.path));

        info!(
            volume_id = %id,
            markers = ?markers,
            files = files.len(),
            capacity_bytes,
            free_bytes,
            "Managed volume identified"
        );
        Ok(Some(ManagedVolume {
            id,
            mount_path: mount_path.to_path_buf(),
            capacity_bytes,
            free_bytes,
            markers,
            files,
        }))
    }

    async fn volume_id(
        &self,
        mount_path: &Path,
        markers: &[String],
        capacity: u64,
    ) -> Result<VolumeId, SyncError> {
        if markers.iter().any(|m| m == ID_FILE) {
            let content = tokio::fs::read(mount_path.join(ID_FILE)).await?;
            let text = String::from_utf8_lossy(&content);
            if let Some(id) = text
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .and_then(|l| VolumeId::new(l).ok())
            {
                return Ok(id);
            }
        }
        let mut sorted = markers.to_vec();
        sorted.sort();
        let digest = hash_bytes(format!("{}\n{capacity}", sorted.join("\n")).as_bytes());
        Ok(VolumeId::new(format!("vol-{}", &digest.as_str()[..16]))?)
    }

    /// Compare `volume` with the archive
    #[instrument(skip_all, fields(volume_id = %volume.id))]
    pub async fn reconcile(&self, volume: &ManagedVolume) -> Result<ReconcilePlan, SyncError> {
        let archive_root = &self.config.archive_root;
        match tokio::fs::metadata(archive_root).await {
            Ok(m) if m.is_dir() => {}
            _ => return Err(SyncError::RootUnavailable(archive_root.clone())),
        }

        // The inject side owns every path the archive's volume tree holds,
        // so injected files are never classified as device output.
        let inject_root = self.inject_root();
        let managed = if tokio::fs::metadata(&inject_root).await.is_ok() {
            let outcome = self.archive.scan(&inject_root, None).await?;
            self.archive.commit(&inject_root, &outcome).await?;
            let mut known: Vec<FileRecord> =
                self.archive.known(&inject_root).await?.into_values().collect();
            known.sort_by(|a, b| a.path.cmp(&b.path));
            known
        } else {
            debug!(inject_root = %inject_root.display(), "No inject directory in archive");
            Vec::new()
        };
        let managed_paths: HashSet<&RecordPath> = managed.iter().map(|r| &r.path).collect();

        let mut extract = Vec::new();
        let mut claimed: HashSet<RecordPath> = HashSet::new();
        for file in &volume.files {
            if managed_paths.contains(&file.path) {
                continue;
            }
            let Some(kind) = self.patterns.classify(&file.path) else {
                continue;
            };
            let content = if kind == ExtractKind::Logbook {
                let bytes = tokio::fs::read(file.path.to_path(&volume.mount_path)).await?;
                Some(String::from_utf8_lossy(&bytes).into_owned())
            } else {
                None
            };
            let name =
                self.patterns
                    .archive_name(kind, &file.path, content.as_deref(), file.modified)?;
            let (target, action) = self.resolve_target(&name, file, &claimed).await?;
            claimed.insert(target.clone());
            extract.push(ExtractItem {
                source: file.clone(),
                kind,
                target,
                action,
            });
        }

        let mut inject = Vec::new();
        let mut unchanged = Vec::new();
        for record in managed {
            match volume.file(&record.path) {
                Some(on_volume) if on_volume.same_content(&record) => unchanged.push(record.path),
                _ => inject.push(record),
            }
        }

        let required_bytes = inject.iter().map(|r| r.size).sum();
        let plan = ReconcilePlan {
            volume_id: volume.id.clone(),
            extract,
            inject,
            unchanged,
            required_bytes,
        };
        info!(
            extract = plan.extract.len(),
            inject = plan.inject.len(),
            unchanged = plan.unchanged.len(),
            required_bytes,
            "Reconcile plan built"
        );
        Ok(plan)
    }

    /// Pick a free archive name for `name`, suffixing on conflicts
    async fn resolve_target(
        &self,
        name: &RecordPath,
        file: &FileRecord,
        claimed: &HashSet<RecordPath>,
    ) -> Result<(RecordPath, ExtractAction), SyncError> {
        let mut candidate = name.clone();
        let mut n = 0;
        loop {
            if !claimed.contains(&candidate) {
                let abs = candidate.to_path(&self.config.archive_root);
                match tokio::fs::metadata(&abs).await {
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Ok((candidate, ExtractAction::Copy))
                    }
                    Err(e) => return Err(e.into()),
                    Ok(meta) if meta.len() == file.size => {
                        let (fp, _) = hash_file(&abs).await?;
                        if fp == file.fingerprint {
                            return Ok((candidate, ExtractAction::DeleteOnly));
                        }
                    }
                    Ok(_) => {}
                }
            }
            n += 1;
            candidate = suffixed(name, n)?;
        }
    }

    async fn still_mounted(&self, volume: &ManagedVolume) -> bool {
        for marker in &volume.markers {
            if tokio::fs::metadata(volume.mount_path.join(marker)).await.is_ok() {
                return true;
            }
        }
        false
    }

    async fn run(
        &self,
        volume: &ManagedVolume,
        task: &TransferTask,
    ) -> (Result<TransferOutcome, TransferError>, u32) {
        let outcome = self
            .retry
            .execute(task.kind.as_str(), self.retry.max_attempts(), move |_| async move {
                if !self.still_mounted(volume).await {
                    return Err(TransferError::new(
                        ErrorKind::VolumeRemoved,
                        format!("{} is no longer mounted", volume.mount_path.display()),
                    ));
                }
                self.executor.transfer(task).await
            })
            .await;
        (outcome.result, outcome.attempts)
    }

    /// Carry out `plan` on `volume`
    #[instrument(skip_all, fields(volume_id = %volume.id))]
    pub async fn execute(
        &self,
        volume: &ManagedVolume,
        plan: ReconcilePlan,
    ) -> Result<ReconcileReport, SyncError> {
        let _session = self.session.lock().await;
        let started = Instant::now();
        let mut report = ReconcileReport {
            volume_id: volume.id.clone(),
            mount_path: volume.mount_path.clone(),
            extracted: 0,
            injected: 0,
            unchanged: plan.unchanged.len(),
            bytes: 0,
            errors: Vec::new(),
            aborted: false,
            duration: Duration::ZERO,
        };

        for item in &plan.extract {
            let task = TransferTask::new(
                TaskKind::ExtractFromMedia,
                item.source.path.to_path(&volume.mount_path).to_string_lossy(),
                item.target.to_path(&self.config.archive_root).to_string_lossy(),
                item.source.with_path(item.target.clone()),
            );
            if !self.apply(volume, &task, &mut report).await {
                break;
            }
            if item.action == ExtractAction::DeleteOnly {
                debug!(path = %item.source.path, "Archive already held the file");
            }
        }

        if !report.aborted && !plan.inject.is_empty() {
            self.inject(volume, &plan, &mut report).await?;
        }

        report.duration = started.elapsed();
        self.events
            .emit(&SyncEvent::VolumeReconciled {
                volume_id: volume.id.to_string(),
                mount_path: volume.mount_path.display().to_string(),
                extracted: report.extracted,
                injected: report.injected,
                unchanged: report.unchanged,
                bytes: report.bytes,
                duration_ms: report.duration.as_millis() as u64,
                error_kind: report.errors.first().map(|e| e.kind),
            })
            .await;
        Ok(report)
    }

    async fn inject(
        &self,
        volume: &ManagedVolume,
        plan: &ReconcilePlan,
        report: &mut ReconcileReport,
    ) -> Result<(), SyncError> {
        if !self.still_mounted(volume).await {
            report.aborted = true;
            report.errors.push(CycleError::volume(
                ErrorKind::VolumeRemoved,
                volume.mount_path.display().to_string(),
                format!("{} is no longer mounted", volume.mount_path.display()),
            ));
            return Ok(());
        }

        let free = self.space.free_bytes(&volume.mount_path)?;
        if plan.required_bytes > free {
            warn!(
                required_bytes = plan.required_bytes,
                free_bytes = free,
                "Not enough space on volume, refusing injects"
            );
            report.errors.push(CycleError::volume(
                ErrorKind::CapacityExceeded,
                volume.mount_path.display().to_string(),
                format!(
                    "injects need {} bytes, {} free on {}",
                    plan.required_bytes,
                    free,
                    volume.mount_path.display()
                ),
            ));
            return Ok(());
        }

        let inject_root = self.inject_root();
        for record in &plan.inject {
            let task = TransferTask::new(
                TaskKind::CopyToMedia,
                record.path.to_path(&inject_root).to_string_lossy(),
                record.path.to_path(&volume.mount_path).to_string_lossy(),
                record.clone(),
            );
            if !self.apply(volume, &task, report).await {
                break;
            }
        }
        Ok(())
    }

    /// Run one task and fold its result into `report`; false aborts the plan
    async fn apply(
        &self,
        volume: &ManagedVolume,
        task: &TransferTask,
        report: &mut ReconcileReport,
    ) -> bool {
        let (result, attempts) = self.run(volume, task).await;
        match result {
            Ok(outcome) => {
                match task.kind {
                    TaskKind::ExtractFromMedia => report.extracted += 1,
                    _ => report.injected += 1,
                }
                report.bytes += outcome.bytes;
                true
            }
            Err(e) => {
                warn!(
                    source = %task.source,
                    destination = %task.destination,
                    attempts,
                    error_kind = %e.kind,
                    error = %e.message,
                    "Media task failed"
                );
                report.errors.push(CycleError {
                    task_id: Some(task.id),
                    path: Some(task.record.path.to_string()),
                    kind: e.kind,
                    message: e.message,
                });
                if e.kind == ErrorKind::VolumeRemoved {
                    report.aborted = true;
                    return false;
                }
                true
            }
        }
    }

    /// Identify, plan and execute for a newly inserted volume
    ///
    /// Returns `None` for volumes that are not managed.
    pub async fn handle_insertion(
        &self,
        mount_path: &Path,
    ) -> Result<Option<ReconcileReport>, SyncError> {
        let Some(volume) = self.identify(mount_path).await? else {
            return Ok(None);
        };
        let plan = self.reconcile(&volume).await?;
        let report = self.execute(&volume, plan).await?;
        info!(
            volume_id = %report.volume_id,
            extracted = report.extracted,
            injected = report.injected,
            errors = report.errors.len(),
            aborted = report.aborted,
            "Volume session finished"
        );
        Ok(Some(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryEventSink, MemoryRecordStore};
    use crate::transfer::TransferEngine;
    use efisync_core::config::ConfigBuilder;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        volume: PathBuf,
        archive: PathBuf,
        events: Arc<MemoryEventSink>,
        records: Arc<MemoryRecordStore>,
    }

    fn write(path: &Path, content: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let volume = dir.path().join("media");
        let archive = dir.path().join("archive");
        write(&volume.join(ID_FILE), b"\n  GRT-HXR-0042 \n");
        write(&volume.join("NAV.DB"), b"nav v1");
        std::fs::create_dir_all(archive.join("volume")).unwrap();
        Fixture {
            _dir: dir,
            volume,
            archive,
            events: Arc::new(MemoryEventSink::new()),
            records: Arc::new(MemoryRecordStore::new()),
        }
    }

    fn reconciler(f: &Fixture, space: Arc<dyn VolumeSpace>) -> MediaReconciler {
        let config = ConfigBuilder::new()
            .media_archive_root(f.archive.clone())
            .build();
        MediaReconciler::new(
            &config.media,
            &config.sync.exclude,
            RetryPolicy::new(2, Duration::ZERO),
            MediaDeps {
                records: f.records.clone(),
                executor: Arc::new(TransferEngine::new(&config.transfer)),
                space,
                events: f.events.clone(),
            },
        )
        .unwrap()
    }

    fn roomy() -> Arc<dyn VolumeSpace> {
        Arc::new(FixedSpace {
            free: 1 << 30,
            capacity: 1 << 31,
        })
    }

    #[tokio::test]
    async fn test_identify_by_markers_not_path() {
        let f = fixture();
        let r = reconciler(&f, roomy());
        let volume = r.identify(&f.volume).await.unwrap().unwrap();
        assert_eq!(volume.id.as_str(), "GRT-HXR-0042");
        assert_eq!(volume.markers, vec![ID_FILE.to_string(), "NAV.DB".to_string()]);
        assert_eq!(volume.files.len(), 2);

        // Same markers at another mount point give the same identity
        let moved = f.volume.with_file_name("elsewhere");
        std::fs::rename(&f.volume, &moved).unwrap();
        assert_eq!(r.identify(&moved).await.unwrap().unwrap().id, volume.id);
    }

    #[tokio::test]
    async fn test_unmanaged_volume() {
        let f = fixture();
        std::fs::remove_file(f.volume.join("NAV.DB")).unwrap();
        let r = reconciler(&f, roomy());
        assert!(r.identify(&f.volume).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_derived_id_is_stable() {
        let f = fixture();
        std::fs::remove_file(f.volume.join(ID_FILE)).unwrap();
        std::fs::create_dir_all(f.volume.join("DEMO")).unwrap();
        let r = reconciler(&f, roomy());
        let first = r.identify(&f.volume).await.unwrap().unwrap().id;
        let second = r.identify(&f.volume).await.unwrap().unwrap().id;
        assert_eq!(first, second);
        assert!(first.as_str().starts_with("vol-"));
        assert_eq!(first.as_str().len(), 20);
    }

    #[tokio::test]
    async fn test_plan_extracts_only_recognised_files() {
        let f = fixture();
        write(&f.volume.join("DEMO/DEMO-20240101-101500.LOG"), b"flight data");
        write(&f.volume.join("notes.txt"), b"hello");
        let r = reconciler(&f, roomy());
        let volume = r.identify(&f.volume).await.unwrap().unwrap();
        let plan = r.reconcile(&volume).await.unwrap();

        assert_eq!(plan.extract.len(), 1);
        assert_eq!(plan.extract[0].kind, ExtractKind::FlightLog);
        assert_eq!(
            plan.extract[0].target.as_str(),
            "demo/2024-01-01_DEMO-20240101-101500.LOG"
        );
        assert_eq!(plan.extract[0].action, ExtractAction::Copy);
        assert!(plan.inject.is_empty());
    }

    #[tokio::test]
    async fn test_name_collisions() {
        let f = fixture();
        write(&f.volume.join("DEMO-20240101-101500.LOG"), b"new flight");
        write(&f.archive.join("demo/2024-01-01_DEMO-20240101-101500.LOG"), b"older flight");
        write(&f.volume.join("DEMO/DEMO-20240102-101500.LOG"), b"same");
        write(&f.archive.join("demo/2024-01-02_DEMO-20240102-101500.LOG"), b"same");
        let r = reconciler(&f, roomy());
        let volume = r.identify(&f.volume).await.unwrap().unwrap();
        let plan = r.reconcile(&volume).await.unwrap();

        let by_target: Vec<(&str, ExtractAction)> = plan
            .extract
            .iter()
            .map(|e| (e.target.as_str(), e.action))
            .collect();
        assert!(by_target.contains(&("demo/2024-01-01_DEMO-20240101-101500-1.LOG", ExtractAction::Copy)));
        assert!(by_target.contains(&("demo/2024-01-02_DEMO-20240102-101500.LOG", ExtractAction::DeleteOnly)));
    }

    #[tokio::test]
    async fn test_execute_then_second_plan_is_empty() {
        let f = fixture();
        write(&f.volume.join("DEMO/DEMO-20240101-101500.LOG"), b"flight data");
        write(&f.volume.join("SNAP/SNAP_20240101_120000.png"), b"png");
        write(&f.archive.join("volume/NAV.DB"), b"nav v2");
        write(&f.archive.join("volume/charts/KPAO.bin"), b"chart");
        let r = reconciler(&f, roomy());

        let volume = r.identify(&f.volume).await.unwrap().unwrap();
        let plan = r.reconcile(&volume).await.unwrap();
        assert_eq!(plan.extract.len(), 2);
        assert_eq!(plan.inject.len(), 2);
        let report = r.execute(&volume, plan).await.unwrap();
        assert_eq!(report.extracted, 2);
        assert_eq!(report.injected, 2);
        assert!(report.errors.is_empty());

        assert!(!f.volume.join("DEMO/DEMO-20240101-101500.LOG").exists());
        assert_eq!(
            std::fs::read(f.archive.join("demo/2024-01-01_DEMO-20240101-101500.LOG")).unwrap(),
            b"flight data"
        );
        assert_eq!(std::fs::read(f.volume.join("NAV.DB")).unwrap(), b"nav v2");
        assert_eq!(std::fs::read(f.volume.join("charts/KPAO.bin")).unwrap(), b"chart");

        let volume = r.identify(&f.volume).await.unwrap().unwrap();
        let again = r.reconcile(&volume).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(again.unchanged.len(), 2);
        assert_eq!(f.events.named("volume_reconciled").await.len(), 1);
    }

    async fn run_with_free(free: u64) -> (Fixture, ReconcileReport) {
        let f = fixture();
        write(&f.archive.join("volume/NAV.DB"), b"nav v2 longer");
        write(&f.archive.join("volume/charts/a.bin"), b"0123456789");
        let r = reconciler(&f, Arc::new(FixedSpace { free, capacity: 1 << 20 }));
        let volume = r.identify(&f.volume).await.unwrap().unwrap();
        let plan = r.reconcile(&volume).await.unwrap();
        assert_eq!(plan.required_bytes, 23);
        let report = r.execute(&volume, plan).await.unwrap();
        (f, report)
    }

    #[tokio::test]
    async fn test_capacity_exactly_enough() {
        let (f, report) = run_with_free(23).await;
        assert!(report.errors.is_empty());
        assert_eq!(report.injected, 2);
        assert_eq!(std::fs::read(f.volume.join("NAV.DB")).unwrap(), b"nav v2 longer");
    }

    #[tokio::test]
    async fn test_capacity_one_byte_short_writes_nothing() {
        let (f, report) = run_with_free(22).await;
        assert_eq!(report.injected, 0);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].kind, ErrorKind::CapacityExceeded);
        assert!(report.errors[0].task_id.is_none());
        assert_eq!(
            report.errors[0].path.as_deref(),
            Some(f.volume.display().to_string().as_str())
        );
        assert_eq!(std::fs::read(f.volume.join("NAV.DB")).unwrap(), b"nav v1");
        assert!(!f.volume.join("charts").exists());
    }

    #[tokio::test]
    async fn test_missing_archive_is_global_error() {
        let f = fixture();
        std::fs::remove_dir_all(&f.archive).unwrap();
        let r = reconciler(&f, roomy());
        let volume = r.identify(&f.volume).await.unwrap().unwrap();
        let err = r.reconcile(&volume).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArchiveUnavailable);
    }

    #[tokio::test]
    async fn test_removed_volume_aborts_plan() {
        let f = fixture();
        write(&f.volume.join("DEMO-20240101-101500.LOG"), b"one");
        write(&f.volume.join("DEMO-20240101-111500.LOG"), b"two");
        let r = reconciler(&f, roomy());
        let volume = r.identify(&f.volume).await.unwrap().unwrap();
        let plan = r.reconcile(&volume).await.unwrap();
        std::fs::remove_dir_all(&f.volume).unwrap();

        let report = r.execute(&volume, plan).await.unwrap();
        assert!(report.aborted);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].kind, ErrorKind::VolumeRemoved);
        assert_eq!(report.extracted, 0);
    }

    #[tokio::test]
    async fn test_injected_file_matching_extract_pattern_stays_put() {
        let f = fixture();
        write(&f.archive.join("volume/splash.png"), b"boot splash");
        write(&f.archive.join("volume/NAV.DB"), b"nav v1");
        let r = reconciler(&f, roomy());

        let volume = r.identify(&f.volume).await.unwrap().unwrap();
        let plan = r.reconcile(&volume).await.unwrap();
        assert!(plan.extract.is_empty());
        assert_eq!(plan.inject.len(), 1);
        assert_eq!(plan.inject[0].path.as_str(), "splash.png");
        r.execute(&volume, plan).await.unwrap();
        assert_eq!(std::fs::read(f.volume.join("splash.png")).unwrap(), b"boot splash");

        let volume = r.identify(&f.volume).await.unwrap().unwrap();
        let again = r.reconcile(&volume).await.unwrap();
        assert!(again.is_empty(), "second plan: {again:?}");
        assert_eq!(again.unchanged.len(), 2);
        assert!(f.volume.join("splash.png").exists());
        assert!(!f.archive.join("snapshots").exists());
    }

    #[tokio::test]
    async fn test_changed_injected_file_is_reinjected_not_extracted() {
        let f = fixture();
        write(&f.archive.join("volume/splash.png"), b"new splash");
        write(&f.volume.join("splash.png"), b"old splash");
        let r = reconciler(&f, roomy());

        let volume = r.identify(&f.volume).await.unwrap().unwrap();
        let plan = r.reconcile(&volume).await.unwrap();
        assert!(plan.extract.is_empty());
        assert_eq!(plan.inject.len(), 1);
    }
}
