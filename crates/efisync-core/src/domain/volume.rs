//! ManagedVolume - a removable medium that passed marker identification
//!
//! Derived fresh on every insertion and never persisted.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::file_record::FileRecord;
use super::newtypes::{RecordPath, VolumeId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedVolume {
    pub id: VolumeId,
    pub mount_path: PathBuf,
    pub capacity_bytes: u64,
    pub free_bytes: u64,
    /// Markers that were found, in catalogue order
    pub markers: Vec<String>,
    pub files: Vec<FileRecord>,
}

impl ManagedVolume {
    /// Look up the record at `path`
    #[must_use]
    pub fn file(&self, path: &RecordPath) -> Option<&FileRecord> {
        self.files.iter().find(|f| &f.path == path)
    }

    /// Total bytes of every file on the volume
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}
