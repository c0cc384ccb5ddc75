//! FileRecord - the observed state of one file

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{Fingerprint, RecordPath, VersionTag};

/// Immutable description of a file's content at one point in time
///
/// A changed file gets a new record; records are never mutated in place.
/// Two records describe the same content when fingerprint and size match,
/// the modification time alone is never trusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: RecordPath,
    pub size: u64,
    pub fingerprint: Fingerprint,
    pub modified: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<VersionTag>,
}

impl FileRecord {
    /// Build a record, deriving the version tag from the file name
    #[must_use]
    pub fn new(
        path: RecordPath,
        size: u64,
        fingerprint: Fingerprint,
        modified: DateTime<Utc>,
    ) -> Self {
        let version = VersionTag::from_file_name(path.file_name());
        Self {
            path,
            size,
            fingerprint,
            modified,
            version,
        }
    }

    /// True when both records describe identical bytes
    #[must_use]
    pub fn same_content(&self, other: &FileRecord) -> bool {
        self.size == other.size && self.fingerprint == other.fingerprint
    }

    /// True when the cheap stat fields still match, so no re-hash is needed
    #[must_use]
    pub fn matches_stat(&self, size: u64, modified: DateTime<Utc>) -> bool {
        self.size == size && self.modified == modified
    }

    /// Same content under another path
    #[must_use]
    pub fn with_path(&self, path: RecordPath) -> Self {
        let version = VersionTag::from_file_name(path.file_name());
        Self {
            path,
            version,
            ..self.clone()
        }
    }
}
