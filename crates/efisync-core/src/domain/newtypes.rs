//! Domain newtypes with validation
//!
//! This module provides strongly-typed wrappers for domain identifiers and values.
//! Each newtype ensures data validity at construction time.

use std::fmt::{self, Display, Formatter};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::DomainError;

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier of a queued transfer task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Create a new random TaskId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a TaskId from an existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID value
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| DomainError::InvalidId(format!("Invalid UUID: {e}")))
    }
}

/// Stable logical identifier of a managed volume, independent of its mount point
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VolumeId(String);

impl VolumeId {
    const MAX_LEN: usize = 128;

    /// Create a new VolumeId
    ///
    /// # Errors
    /// Returns error if the identifier is empty or too long
    pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(DomainError::InvalidId(
                "Volume id cannot be empty".to_string(),
            ));
        }
        if id.len() > Self::MAX_LEN {
            return Err(DomainError::InvalidId(format!(
                "Volume id longer than {} bytes",
                Self::MAX_LEN
            )));
        }
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for VolumeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for VolumeId {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<VolumeId> for String {
    fn from(id: VolumeId) -> Self {
        id.0
    }
}

// ============================================================================
// Content fingerprint
// ============================================================================

/// SHA-256 content fingerprint as 64 lowercase hex characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    const HEX_LEN: usize = 64;

    /// Create a Fingerprint from its hex form
    ///
    /// # Errors
    /// Returns error unless the input is 64 hex characters
    pub fn new(hex: impl Into<String>) -> Result<Self, DomainError> {
        let hex = hex.into().to_ascii_lowercase();
        if hex.len() != Self::HEX_LEN || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DomainError::InvalidFingerprint(hex));
        }
        Ok(Self(hex))
    }

    /// Build a Fingerprint from a raw 32-byte digest
    #[must_use]
    pub fn from_digest(digest: &[u8]) -> Self {
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            hex.push_str(&format!("{byte:02x}"));
        }
        Self(hex)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, for log lines
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.0
    }
}

// ============================================================================
// Relative record path
// ============================================================================

/// A normalized path relative to a sync root, always `/`-separated
///
/// RecordPath ensures the path is:
/// - Relative (no leading `/`)
/// - Normalized (no empty, `.` or `..` components)
/// - Non-empty
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordPath(String);

impl RecordPath {
    /// Create a RecordPath from its `/`-separated form
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPath` on absolute, empty or escaping paths
    pub fn new(path: impl Into<String>) -> Result<Self, DomainError> {
        let raw = path.into().replace('\\', "/");
        if raw.starts_with('/') {
            return Err(DomainError::InvalidPath(format!(
                "Path must be relative: {raw}"
            )));
        }
        let mut parts = Vec::new();
        for part in raw.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    return Err(DomainError::InvalidPath(format!(
                        "Path escapes its root: {raw}"
                    )))
                }
                p => parts.push(p),
            }
        }
        if parts.is_empty() {
            return Err(DomainError::InvalidPath("Path cannot be empty".to_string()));
        }
        Ok(Self(parts.join("/")))
    }

    /// Build a RecordPath from a filesystem path relative to a root
    ///
    /// # Errors
    /// Returns error if the path has non-UTF-8 or non-normal components
    pub fn from_relative(path: &Path) -> Result<Self, DomainError> {
        let mut parts = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(c) => parts.push(c.to_str().ok_or_else(|| {
                    DomainError::InvalidPath(format!("Non UTF-8 path: {}", path.display()))
                })?),
                Component::CurDir => {}
                _ => {
                    return Err(DomainError::InvalidPath(format!(
                        "Path must be relative and normalized: {}",
                        path.display()
                    )))
                }
            }
        }
        Self::new(parts.join("/"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolve this path under `root`
    #[must_use]
    pub fn to_path(&self, root: &Path) -> PathBuf {
        let mut out = root.to_path_buf();
        for part in self.0.split('/') {
            out.push(part);
        }
        out
    }

    /// Final component
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Prepend a relative prefix; an empty prefix returns the path unchanged
    ///
    /// # Errors
    /// Returns error if the prefix is absolute or escaping
    pub fn prefixed(&self, prefix: &str) -> Result<Self, DomainError> {
        if prefix.trim_matches('/').is_empty() {
            return Ok(self.clone());
        }
        Self::new(format!("{prefix}/{}", self.0))
    }

    /// Strip a leading relative prefix, `None` if the path lies outside it
    #[must_use]
    pub fn strip_prefix(&self, prefix: &str) -> Option<Self> {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            return Some(self.clone());
        }
        self.0
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .and_then(|rest| Self::new(rest).ok())
    }
}

impl Display for RecordPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordPath {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RecordPath {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<RecordPath> for String {
    fn from(p: RecordPath) -> Self {
        p.0
    }
}

// ============================================================================
// Semantic version tag
// ============================================================================

/// Dotted numeric version embedded in a file name, e.g. `8.12` or `2.3.1`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionTag(Vec<u32>);

impl VersionTag {
    /// Find the first `major.minor[.patch]` run in a file name
    ///
    /// A run must be delimited by non-digits so that date stamps such as
    /// `20240101-120000` never parse as versions.
    #[must_use]
    pub fn from_file_name(name: &str) -> Option<Self> {
        let bytes = name.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i].is_ascii_digit() && (i == 0 || !bytes[i - 1].is_ascii_digit()) {
                let (parts, _) = Self::scan_run(&bytes[i..]);
                if parts.len() >= 2 {
                    return Some(Self(parts));
                }
            }
            i += 1;
        }
        None
    }

    /// Parse up to three dot-separated numbers, returning them and the bytes consumed
    fn scan_run(bytes: &[u8]) -> (Vec<u32>, usize) {
        let mut parts = Vec::new();
        let mut pos = 0;
        while parts.len() < 3 {
            let start = pos;
            while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                pos += 1;
            }
            if pos == start {
                break;
            }
            let Some(value) = std::str::from_utf8(&bytes[start..pos])
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
            else {
                break;
            };
            parts.push(value);
            if pos + 1 < bytes.len() && bytes[pos] == b'.' && bytes[pos + 1].is_ascii_digit() {
                pos += 1;
            } else {
                break;
            }
        }
        (parts, pos)
    }

    #[must_use]
    pub fn components(&self) -> &[u32] {
        &self.0
    }
}

impl Display for VersionTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u32::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

impl FromStr for VersionTag {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (parts, consumed) = Self::scan_run(s.as_bytes());
        if parts.len() < 2 || consumed != s.len() {
            return Err(DomainError::ValidationFailed(format!(
                "Not a version tag: {s}"
            )));
        }
        Ok(Self(parts))
    }
}

impl TryFrom<String> for VersionTag {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<VersionTag> for String {
    fn from(v: VersionTag) -> Self {
        v.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod task_id_tests {
        use super::*;

        #[test]
        fn test_parse_roundtrip() {
            let id = TaskId::new();
            let parsed: TaskId = id.to_string().parse().unwrap();
            assert_eq!(id, parsed);
        }

        #[test]
        fn test_invalid() {
            assert!("not-a-uuid".parse::<TaskId>().is_err());
        }
    }

    mod fingerprint_tests {
        use super::*;

        #[test]
        fn test_from_digest_is_lowercase_hex() {
            let fp = Fingerprint::from_digest(&[0xAB; 32]);
            assert_eq!(fp.as_str().len(), 64);
            assert!(fp.as_str().starts_with("abab"));
            assert_eq!(fp.short(), "abababababab");
        }

        #[test]
        fn test_new_normalizes_case() {
            let upper = "A".repeat(64);
            let fp = Fingerprint::new(upper).unwrap();
            assert_eq!(fp.as_str(), "a".repeat(64));
        }

        #[test]
        fn test_invalid() {
            assert!(Fingerprint::new("abc").is_err());
            assert!(Fingerprint::new("z".repeat(64)).is_err());
        }
    }

    mod record_path_tests {
        use super::*;

        #[test]
        fn test_normalizes_separators() {
            let p = RecordPath::new("DEMO//./DEMO-20240101-120000.LOG").unwrap();
            assert_eq!(p.as_str(), "DEMO/DEMO-20240101-120000.LOG");
            assert_eq!(p.file_name(), "DEMO-20240101-120000.LOG");

            let p = RecordPath::new("nav\\db\\NAV.DB").unwrap();
            assert_eq!(p.as_str(), "nav/db/NAV.DB");
        }

        #[test]
        fn test_rejects_absolute_empty_and_escaping() {
            assert!(RecordPath::new("/etc/passwd").is_err());
            assert!(RecordPath::new("").is_err());
            assert!(RecordPath::new("a/../../b").is_err());
        }

        #[test]
        fn test_from_relative_and_to_path() {
            let p = RecordPath::from_relative(Path::new("a/b/c.txt")).unwrap();
            assert_eq!(p.as_str(), "a/b/c.txt");
            assert_eq!(
                p.to_path(Path::new("/root")),
                PathBuf::from("/root/a/b/c.txt")
            );
            assert!(RecordPath::from_relative(Path::new("/abs")).is_err());
        }

        #[test]
        fn test_prefix_roundtrip() {
            let p = RecordPath::new("x/y.bin").unwrap();
            let prefixed = p.prefixed("logs").unwrap();
            assert_eq!(prefixed.as_str(), "logs/x/y.bin");
            assert_eq!(prefixed.strip_prefix("logs"), Some(p.clone()));
            assert_eq!(prefixed.strip_prefix("other"), None);
            assert_eq!(p.prefixed("").unwrap(), p);
            assert!(RecordPath::new("logsX/a")
                .unwrap()
                .strip_prefix("logs")
                .is_none());
        }

        #[test]
        fn test_serde_rejects_invalid() {
            let bad: Result<RecordPath, _> = serde_json::from_str("\"../x\"");
            assert!(bad.is_err());
        }
    }

    mod volume_id_tests {
        use super::*;

        #[test]
        fn test_trims_and_rejects_empty() {
            assert_eq!(VolumeId::new("  N123AB \n").unwrap().as_str(), "N123AB");
            assert!(VolumeId::new("   ").is_err());
            assert!(VolumeId::new("x".repeat(200)).is_err());
        }
    }

    mod version_tag_tests {
        use super::*;

        #[test]
        fn test_from_file_name() {
            let v = VersionTag::from_file_name("GRT_HXr_8.12.bin").unwrap();
            assert_eq!(v.to_string(), "8.12");
            let v = VersionTag::from_file_name("nav-v2.3.1.db").unwrap();
            assert_eq!(v.components(), &[2, 3, 1]);
        }

        #[test]
        fn test_dates_are_not_versions() {
            assert!(VersionTag::from_file_name("DEMO-20240101-120000.LOG").is_none());
            assert!(VersionTag::from_file_name("notes.txt").is_none());
        }

        #[test]
        fn test_ordering() {
            let a: VersionTag = "8.9".parse().unwrap();
            let b: VersionTag = "8.12".parse().unwrap();
            assert!(a < b);
            assert!("8".parse::<VersionTag>().is_err());
            assert!("8.1x".parse::<VersionTag>().is_err());
        }
    }
}
