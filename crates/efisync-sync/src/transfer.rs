//! Transfer Engine - one verified transfer per task
//!
//! Every write goes to `<name>.efisync-tmp-<uuid>` next to the destination,
//! is fingerprinted while streaming and is renamed over the destination only
//! when the fingerprint equals the task's record. A mismatch removes the
//! temp file and fails with a retryable `ChecksumMismatch`.
//!
//! Push and pull run over the [`wire`](crate::wire) protocol; media copies
//! are local file-to-file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use efisync_core::{
    config::TransferConfig,
    domain::{
        ErrorKind, Fingerprint, RecordPath, TaskKind, TransferError, TransferTask,
    },
    ports::{ITransferExecutor, TransferOutcome},
};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::fingerprint::{hash_file, StreamingFingerprint};
use crate::wire::WireClient;

/// Infix of temporary files written by the engine
pub const TEMP_MARKER: &str = ".efisync-tmp-";

/// Temp file used while writing `destination`
#[must_use]
pub fn temp_path_for(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    destination.with_file_name(format!("{name}{TEMP_MARKER}{}", Uuid::new_v4().simple()))
}

/// True when `path` holds identical content to `fingerprint`
pub(crate) async fn already_present(path: &Path, size: u64, fingerprint: &Fingerprint) -> bool {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() == size => {
            matches!(hash_file(path).await, Ok((fp, _)) if &fp == fingerprint)
        }
        _ => false,
    }
}

// ============================================================================
// LocalSink
// ============================================================================

/// Streaming writer behind the temp-write, verify, rename path
///
/// Dropping a sink that was not committed removes its temp file.
pub struct LocalSink {
    destination: PathBuf,
    temp: PathBuf,
    file: Option<fs::File>,
    hasher: StreamingFingerprint,
    done: bool,
}

impl LocalSink {
    /// Open a temp file next to `destination`, creating missing directories
    pub async fn create(destination: &Path) -> Result<Self, TransferError> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::io(format!("create {}", parent.display()), &e))?;
        }
        let temp = temp_path_for(destination);
        let file = fs::File::create(&temp)
            .await
            .map_err(|e| TransferError::io(format!("create {}", temp.display()), &e))?;
        Ok(Self {
            destination: destination.to_path_buf(),
            temp,
            file: Some(file),
            hasher: StreamingFingerprint::new(),
            done: false,
        })
    }

    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), TransferError> {
        let Some(file) = self.file.as_mut() else {
            return Err(TransferError::new(ErrorKind::Protocol, "sink already closed"));
        };
        file.write_all(chunk)
            .await
            .map_err(|e| TransferError::io(format!("write {}", self.temp.display()), &e))?;
        self.hasher.update(chunk);
        Ok(())
    }

    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.hasher.bytes()
    }

    /// Sync, verify against `expected` and rename into place
    pub async fn commit(mut self, expected: &Fingerprint) -> Result<(Fingerprint, u64), TransferError> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .map_err(|e| TransferError::io(format!("flush {}", self.temp.display()), &e))?;
            file.sync_all()
                .await
                .map_err(|e| TransferError::io(format!("sync {}", self.temp.display()), &e))?;
        }
        let (fingerprint, bytes) = std::mem::take(&mut self.hasher).finish();
        if &fingerprint != expected {
            return Err(TransferError::new(
                ErrorKind::ChecksumMismatch,
                format!(
                    "{}: expected {}, wrote {}",
                    self.destination.display(),
                    expected.short(),
                    fingerprint.short()
                ),
            ));
        }
        fs::rename(&self.temp, &self.destination)
            .await
            .map_err(|e| {
                TransferError::io(format!("rename into {}", self.destination.display()), &e)
            })?;
        self.done = true;
        Ok((fingerprint, bytes))
    }
}

impl Drop for LocalSink {
    fn drop(&mut self) {
        if !self.done {
            self.file.take();
            let _ = std::fs::remove_file(&self.temp);
        }
    }
}

// ============================================================================
// TransferEngine
// ============================================================================

/// Executes transfer tasks
pub struct TransferEngine {
    chunk_size: usize,
    verify_read_back: bool,
    wire: Option<Arc<WireClient>>,
}

impl TransferEngine {
    #[must_use]
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            chunk_size: config.chunk_size().max(1),
            verify_read_back: config.verify_media_read_back,
            wire: None,
        }
    }

    /// Route push and pull tasks through `client`
    #[must_use]
    pub fn with_wire(mut self, client: Arc<WireClient>) -> Self {
        self.wire = Some(client);
        self
    }

    fn wire(&self) -> Result<&WireClient, TransferError> {
        self.wire
            .as_deref()
            .ok_or_else(|| TransferError::new(ErrorKind::Protocol, "no endpoint configured"))
    }

    /// Verified local copy used for media tasks
    async fn copy_local(&self, task: &TransferTask) -> Result<TransferOutcome, TransferError> {
        let started = Instant::now();
        let source = Path::new(&task.source);
        let destination = Path::new(&task.destination);
        let expected = &task.record.fingerprint;

        if already_present(destination, task.record.size, expected).await {
            debug!(destination = %destination.display(), "Destination already current");
            return Ok(TransferOutcome {
                bytes: 0,
                fingerprint: expected.clone(),
                skipped: true,
                duration: started.elapsed(),
            });
        }

        let mut file = match fs::File::open(source).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Extract sources whose directory vanished sit on an unplugged medium
                let parent_gone = match source.parent() {
                    Some(parent) => fs::metadata(parent).await.is_err(),
                    None => false,
                };
                let kind = if task.kind == TaskKind::ExtractFromMedia && parent_gone {
                    ErrorKind::VolumeRemoved
                } else {
                    ErrorKind::SourceMissing
                };
                return Err(TransferError::new(kind, format!("{} not found", source.display())));
            }
            Err(e) => return Err(TransferError::io(format!("open {}", source.display()), &e)),
        };

        let mut sink = LocalSink::create(destination).await?;
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| TransferError::io(format!("read {}", source.display()), &e))?;
            if n == 0 {
                break;
            }
            sink.write(&buf[..n]).await?;
        }
        let (fingerprint, bytes) = sink.commit(expected).await.map_err(|e| {
            if e.kind == ErrorKind::ChecksumMismatch {
                TransferError::new(ErrorKind::SourceChanged, e.message)
            } else {
                e
            }
        })?;

        if self.verify_read_back && task.kind == TaskKind::CopyToMedia {
            let read_back = hash_file(destination)
                .await
                .map_err(|e| TransferError::io(format!("read back {}", destination.display()), &e))?;
            if &read_back.0 != expected {
                if let Err(e) = fs::remove_file(destination).await {
                    debug!(
                        path = %destination.display(),
                        error = %e,
                        "Could not remove unverified copy"
                    );
                }
                return Err(TransferError::new(
                    ErrorKind::VerifyFailed,
                    format!("{} read back {}", destination.display(), read_back.0.short()),
                ));
            }
        }

        Ok(TransferOutcome {
            bytes,
            fingerprint,
            skipped: false,
            duration: started.elapsed(),
        })
    }
}

#[async_trait::async_trait]
impl ITransferExecutor for TransferEngine {
    #[instrument(skip(self, task), fields(task_id = %task.id, kind = %task.kind))]
    async fn transfer(&self, task: &TransferTask) -> Result<TransferOutcome, TransferError> {
        let outcome = match task.kind {
            TaskKind::Push => {
                let remote = RecordPath::new(task.destination.as_str())
                    .map_err(|e| TransferError::new(ErrorKind::Protocol, e.to_string()))?;
                self.wire()?
                    .push(Path::new(&task.source), &task.record, &remote)
                    .await?
            }
            TaskKind::Pull => {
                let remote = RecordPath::new(task.source.as_str())
                    .map_err(|e| TransferError::new(ErrorKind::Protocol, e.to_string()))?;
                self.wire()?
                    .pull(&remote, Path::new(&task.destination), &task.record)
                    .await?
            }
            TaskKind::CopyToMedia => self.copy_local(task).await?,
            TaskKind::ExtractFromMedia => {
                let outcome = self.copy_local(task).await?;
                match fs::remove_file(&task.source).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(TransferError::io(format!("remove {}", task.source), &e))
                    }
                }
                outcome
            }
        };
        debug!(
            bytes = outcome.bytes,
            skipped = outcome.skipped,
            duration_ms = outcome.duration.as_millis() as u64,
            "Transfer verified"
        );
        Ok(outcome)
    }
}

// ============================================================================
// Orphan cleanup
// ============================================================================

/// Remove temp files under `root` older than `older_than`
///
/// Returns how many were removed. Unreadable directories are skipped.
pub async fn cleanup_orphans(root: &Path, older_than: Duration) -> std::io::Result<usize> {
    let cutoff = SystemTime::now()
        .checked_sub(older_than)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut removed = 0;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if dir.as_path() == root => return Err(e),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Skipping directory during cleanup");
                continue;
            }
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(entry.path());
                continue;
            }
            if !file_type.is_file() || !entry.file_name().to_string_lossy().contains(TEMP_MARKER) {
                continue;
            }
            let modified = entry.metadata().await?.modified()?;
            if modified <= cutoff {
                match fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %entry.path().display(), error = %e, "Could not remove orphan"),
                }
            }
        }
    }
    if removed > 0 {
        info!(root = %root.display(), removed, "Removed orphaned temp files");
    }
    Ok(removed)
}
