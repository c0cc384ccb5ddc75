//! Change Detector - incremental scans of a source tree
//!
//! ## Flow
//!
//! ```text
//! walk root ──→ stat matches last-known record? ──yes──→ unchanged (no hash)
//!                     │ no
//!                     ▼
//!              stability re-stat after delay ──changed──→ skipped this scan
//!                     │ stable
//!                     ▼
//!                 fingerprint ──same content──→ refreshed (stat fields only)
//!                     │ different / new
//!                     ▼
//!                  changed
//! ```
//!
//! A scan does not touch the record table. The caller enqueues the changed
//! records first and then calls [`ChangeDetector::commit`], so a crash between
//! the two re-detects the same changes instead of losing them.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use efisync_core::{
    domain::{FileRecord, RecordPath},
    ports::{IRecordStore, RecordMap},
};
use tracing::{debug, info, instrument, warn};

use crate::fingerprint::hash_file;
use crate::SyncError;

// ============================================================================
// Exclude patterns
// ============================================================================

/// Compiled exclude globs, matched against file names and relative paths
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    patterns: Vec<glob::Pattern>,
}

impl ExcludeSet {
    /// Compile `patterns`
    ///
    /// # Errors
    /// Returns `SyncError::InvalidPattern` for the first pattern that fails
    pub fn new(patterns: &[String]) -> Result<Self, SyncError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                glob::Pattern::new(p).map_err(|e| SyncError::InvalidPattern(format!("{p}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// True when the entry at `relative` (file name `name`) is excluded
    ///
    /// Transfer temp files are always excluded.
    #[must_use]
    pub fn is_excluded(&self, relative: &str, name: &str) -> bool {
        name.contains(crate::transfer::TEMP_MARKER)
            || self
                .patterns
                .iter()
                .any(|p| p.matches(name) || p.matches(relative))
    }
}

// ============================================================================
// Scan outcome
// ============================================================================

/// Result of one scan of a root
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    /// New files and files whose content changed
    pub changed: Vec<FileRecord>,
    /// Files with new stat fields but identical content
    pub refreshed: Vec<FileRecord>,
    /// Known paths that no longer exist
    pub removed: Vec<RecordPath>,
    /// Files still being written; picked up by a later scan
    pub unstable: Vec<RecordPath>,
    /// Files that could not be read
    pub unreadable: Vec<RecordPath>,
}

impl ScanOutcome {
    /// True when nothing needs to be enqueued or committed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.refreshed.is_empty() && self.removed.is_empty()
    }
}

/// A regular file seen during the walk
struct Candidate {
    path: RecordPath,
    abs: PathBuf,
    size: u64,
    modified: DateTime<Utc>,
}

pub(crate) fn to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

// ============================================================================
// ChangeDetector
// ============================================================================

/// Scans source trees and reports what changed since the last commit
pub struct ChangeDetector {
    store: Arc<dyn IRecordStore>,
    excludes: ExcludeSet,
    stability_delay: Duration,
    hashes: AtomicU64,
}

impl ChangeDetector {
    /// Create a detector over `store`
    ///
    /// # Errors
    /// Returns an error if an exclude pattern is invalid
    pub fn new(
        store: Arc<dyn IRecordStore>,
        exclude: &[String],
        stability_delay: Duration,
    ) -> Result<Self, SyncError> {
        Ok(Self {
            store,
            excludes: ExcludeSet::new(exclude)?,
            stability_delay,
            hashes: AtomicU64::new(0),
        })
    }

    /// Number of files fingerprinted since creation
    #[must_use]
    pub fn hash_count(&self) -> u64 {
        self.hashes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn excludes(&self) -> &ExcludeSet {
        &self.excludes
    }

    /// Key under which the records of `root` are stored
    #[must_use]
    pub fn root_key(root: &Path) -> String {
        root.to_string_lossy().into_owned()
    }

    /// Last committed records of `root`
    pub async fn known(&self, root: &Path) -> Result<RecordMap, SyncError> {
        Ok(self.store.load(&Self::root_key(root)).await?)
    }

    /// Scan `root` and return new or changed records
    ///
    /// Files already known whose modification time is not after `since`
    /// and whose size is unchanged are skipped without a stat comparison.
    #[instrument(skip(self), fields(root = %root.display()))]
    pub async fn scan(
        &self,
        root: &Path,
        since: Option<DateTime<Utc>>,
    ) -> Result<ScanOutcome, SyncError> {
        match tokio::fs::metadata(root).await {
            Ok(m) if m.is_dir() => {}
            _ => return Err(SyncError::RootUnavailable(root.to_path_buf())),
        }

        let known = self.known(root).await?;
        let candidates = self.walk(root).await?;
        let seen: HashSet<RecordPath> = candidates.iter().map(|c| c.path.clone()).collect();

        let mut outcome = ScanOutcome::default();
        let mut suspects = Vec::new();
        for candidate in candidates {
            match known.get(&candidate.path) {
                Some(record) if record.matches_stat(candidate.size, candidate.modified) => {}
                Some(record)
                    if record.size == candidate.size
                        && since.is_some_and(|s| candidate.modified <= s) => {}
                _ => suspects.push(candidate),
            }
        }

        let stable = self.stability_check(suspects, &mut outcome).await;

        for candidate in stable {
            match hash_file(&candidate.abs).await {
                Ok((fingerprint, bytes)) => {
                    self.hashes.fetch_add(1, Ordering::Relaxed);
                    let record = FileRecord::new(
                        candidate.path.clone(),
                        bytes,
                        fingerprint,
                        candidate.modified,
                    );
                    match known.get(&candidate.path) {
                        Some(old) if old.same_content(&record) => outcome.refreshed.push(record),
                        _ => outcome.changed.push(record),
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %candidate.path, "File vanished before hashing");
                }
                Err(e) => {
                    warn!(path = %candidate.path, error = %e, "Skipping unreadable file");
                    outcome.unreadable.push(candidate.path);
                }
            }
        }

        outcome.removed = known
            .keys()
            .filter(|p| !seen.contains(*p))
            .cloned()
            .collect();
        outcome.changed.sort_by(|a, b| a.path.cmp(&b.path));
        outcome.removed.sort();

        info!(
            changed = outcome.changed.len(),
            refreshed = outcome.refreshed.len(),
            removed = outcome.removed.len(),
            unstable = outcome.unstable.len(),
            "Scan complete"
        );
        Ok(outcome)
    }

    /// Persist the outcome of a scan as the new last-known state
    pub async fn commit(&self, root: &Path, outcome: &ScanOutcome) -> Result<(), SyncError> {
        if outcome.is_empty() {
            return Ok(());
        }
        let upserts: Vec<FileRecord> = outcome
            .changed
            .iter()
            .chain(outcome.refreshed.iter())
            .cloned()
            .collect();
        self.store
            .apply(&Self::root_key(root), &upserts, &outcome.removed)
            .await?;
        debug!(root = %root.display(), upserts = upserts.len(), "Scan committed");
        Ok(())
    }

    /// Walk `root` depth-first, returning regular files that are not excluded
    async fn walk(&self, root: &Path) -> Result<Vec<Candidate>, SyncError> {
        let mut out = Vec::new();
        let mut stack = vec![root.to_path_buf()];

        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if dir.as_path() == root => return Err(e.into()),
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Skipping unreadable directory");
                    continue;
                }
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(dir = %dir.display(), error = %e, "Directory listing interrupted");
                        break;
                    }
                };
                let abs = entry.path();
                let Ok(rel) = abs.strip_prefix(root) else {
                    continue;
                };
                let path = match RecordPath::from_relative(rel) {
                    Ok(p) => p,
                    Err(err) => {
                        warn!(path = ?abs, %err, "Skipping invalid path");
                        continue;
                    }
                };
                let name = entry.file_name().to_string_lossy().into_owned();
                if self.excludes.is_excluded(path.as_str(), &name) {
                    continue;
                }

                let file_type = match entry.file_type().await {
                    Ok(t) => t,
                    Err(_) => continue,
                };
                if file_type.is_symlink() {
                    debug!(path = %path, "Skipping symlink");
                } else if file_type.is_dir() {
                    stack.push(abs);
                } else if file_type.is_file() {
                    match entry.metadata().await {
                        Ok(meta) => out.push(Candidate {
                            path,
                            abs,
                            size: meta.len(),
                            modified: meta.modified().map(to_utc).unwrap_or_else(|_| Utc::now()),
                        }),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => warn!(path = %path, error = %e, "Cannot stat file"),
                    }
                }
            }
        }
        Ok(out)
    }

    /// Re-stat suspects after the stability delay; files still changing are
    /// reported as unstable and files that disappeared are dropped
    async fn stability_check(
        &self,
        suspects: Vec<Candidate>,
        outcome: &mut ScanOutcome,
    ) -> Vec<Candidate> {
        if suspects.is_empty() {
            return suspects;
        }
        if !self.stability_delay.is_zero() {
            tokio::time::sleep(self.stability_delay).await;
        }

        let mut stable = Vec::with_capacity(suspects.len());
        for candidate in suspects {
            match tokio::fs::metadata(&candidate.abs).await {
                Ok(meta) => {
                    let modified = meta.modified().map(to_utc).unwrap_or_else(|_| Utc::now());
                    if meta.len() == candidate.size && modified == candidate.modified {
                        stable.push(candidate);
                    } else {
                        debug!(path = %candidate.path, "File still being written");
                        outcome.unstable.push(candidate.path);
                    }
                }
                Err(_) => debug!(path = %candidate.path, "File vanished during scan"),
            }
        }
        stable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRecordStore;
    use efisync_core::config::DEFAULT_EXCLUDES;
    use tempfile::TempDir;

    fn detector() -> ChangeDetector {
        let excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        ChangeDetector::new(
            Arc::new(MemoryRecordStore::new()),
            &excludes,
            Duration::ZERO,
        )
        .unwrap()
    }

    fn write(dir: &TempDir, rel: &str, data: &[u8]) {
        let p = dir.path().join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, data).unwrap();
    }

    fn paths(records: &[FileRecord]) -> Vec<&str> {
        records.iter().map(|r| r.path.as_str()).collect()
    }

    #[tokio::test]
    async fn test_first_scan_returns_all_then_nothing() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.log", &[1u8; 10]);
        write(&dir, "b.log", &[2u8; 20]);
        let det = detector();

        let first = det.scan(dir.path(), None).await.unwrap();
        assert_eq!(paths(&first.changed), vec!["a.log", "b.log"]);
        assert_eq!(first.changed[0].size, 10);
        assert_eq!(first.changed[1].size, 20);
        det.commit(dir.path(), &first).await.unwrap();

        let second = det.scan(dir.path(), None).await.unwrap();
        assert!(second.changed.is_empty());
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_files_are_not_rehashed() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.log", b"alpha");
        write(&dir, "b.log", b"beta");
        let det = detector();

        let first = det.scan(dir.path(), None).await.unwrap();
        det.commit(dir.path(), &first).await.unwrap();
        assert_eq!(det.hash_count(), 2);

        det.scan(dir.path(), None).await.unwrap();
        assert_eq!(det.hash_count(), 2);
    }

    #[tokio::test]
    async fn test_uncommitted_scan_is_reported_again() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.log", b"alpha");
        let det = detector();

        det.scan(dir.path(), None).await.unwrap();
        let again = det.scan(dir.path(), None).await.unwrap();
        assert_eq!(paths(&again.changed), vec!["a.log"]);
    }

    #[tokio::test]
    async fn test_content_change_detected() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.log", b"v1");
        let det = detector();
        let first = det.scan(dir.path(), None).await.unwrap();
        det.commit(dir.path(), &first).await.unwrap();

        write(&dir, "a.log", b"version two");
        let second = det.scan(dir.path(), None).await.unwrap();
        assert_eq!(paths(&second.changed), vec!["a.log"]);
        assert_ne!(second.changed[0].fingerprint, first.changed[0].fingerprint);
    }

    #[tokio::test]
    async fn test_touched_file_with_same_content_is_refreshed_only() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.log", b"same");
        let det = detector();
        let first = det.scan(dir.path(), None).await.unwrap();
        det.commit(dir.path(), &first).await.unwrap();

        let file = std::fs::File::options()
            .write(true)
            .open(dir.path().join("a.log"))
            .unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(60))
            .unwrap();

        let second = det.scan(dir.path(), None).await.unwrap();
        assert!(second.changed.is_empty());
        assert_eq!(paths(&second.refreshed), vec!["a.log"]);
    }

    #[tokio::test]
    async fn test_since_skips_known_files_not_modified_after_it() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.log", b"same size");
        let det = detector();
        let first = det.scan(dir.path(), None).await.unwrap();
        det.commit(dir.path(), &first).await.unwrap();
        let watermark = Utc::now();

        // Same size, older mtime than the watermark
        write(&dir, "a.log", b"SAME SIZE");
        let file = std::fs::File::options()
            .write(true)
            .open(dir.path().join("a.log"))
            .unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();
        write(&dir, "b.log", b"new");

        let filtered = det.scan(dir.path(), Some(watermark)).await.unwrap();
        assert_eq!(paths(&filtered.changed), vec!["b.log"]);
        assert_eq!(det.hash_count(), 2);

        let full = det.scan(dir.path(), None).await.unwrap();
        assert_eq!(paths(&full.changed), vec!["a.log", "b.log"]);
    }

    #[tokio::test]
    async fn test_removed_files_reported() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.log", b"a");
        write(&dir, "b.log", b"b");
        let det = detector();
        let first = det.scan(dir.path(), None).await.unwrap();
        det.commit(dir.path(), &first).await.unwrap();

        std::fs::remove_file(dir.path().join("b.log")).unwrap();
        let second = det.scan(dir.path(), None).await.unwrap();
        assert_eq!(second.removed, vec![RecordPath::new("b.log").unwrap()]);
        det.commit(dir.path(), &second).await.unwrap();
        assert_eq!(det.known(dir.path()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_excludes_and_dotfiles() {
        let dir = TempDir::new().unwrap();
        write(&dir, ".DS_Store", b"x");
        write(&dir, "scratch.tmp", b"x");
        write(&dir, ".Trashes/old.log", b"x");
        write(&dir, "a.log.efisync-tmp-1234", b"x");
        write(&dir, ".config", b"kept");
        write(&dir, "nested/deep/c.log", b"c");
        let det = detector();

        let outcome = det.scan(dir.path(), None).await.unwrap();
        assert_eq!(paths(&outcome.changed), vec![".config", "nested/deep/c.log"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_are_skipped() {
        let dir = TempDir::new().unwrap();
        write(&dir, "real.log", b"r");
        std::os::unix::fs::symlink(dir.path().join("real.log"), dir.path().join("link.log"))
            .unwrap();
        let outcome = detector().scan(dir.path(), None).await.unwrap();
        assert_eq!(paths(&outcome.changed), vec!["real.log"]);
    }

    #[tokio::test]
    async fn test_missing_root_is_an_error() {
        let err = detector()
            .scan(Path::new("/nonexistent/efisync-root"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RootUnavailable(_)));
    }

    #[tokio::test]
    async fn test_file_growing_during_stability_window_is_deferred() {
        let dir = TempDir::new().unwrap();
        write(&dir, "growing.log", b"start");
        let det = ChangeDetector::new(
            Arc::new(MemoryRecordStore::new()),
            &[],
            Duration::from_millis(200),
        )
        .unwrap();

        let path = dir.path().join("growing.log");
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tokio::fs::write(&path, b"start and more bytes").await.unwrap();
        });

        let outcome = det.scan(dir.path(), None).await.unwrap();
        writer.await.unwrap();
        assert!(outcome.changed.is_empty());
        assert_eq!(outcome.unstable, vec![RecordPath::new("growing.log").unwrap()]);
        assert_eq!(det.hash_count(), 0);
    }

    #[test]
    fn test_invalid_exclude_pattern() {
        let result = ChangeDetector::new(
            Arc::new(MemoryRecordStore::new()),
            &["[".to_string()],
            Duration::ZERO,
        );
        assert!(matches!(result, Err(SyncError::InvalidPattern(_))));
    }

    #[test]
    fn test_temp_files_excluded_without_patterns() {
        let excludes = ExcludeSet::new(&[]).unwrap();
        assert!(excludes.is_excluded("2026/a.log.efisync-tmp-99", "a.log.efisync-tmp-99"));
        assert!(!excludes.is_excluded("2026/a.log", "a.log"));
    }
}
