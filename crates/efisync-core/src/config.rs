//! Configuration module for EFISync.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.
//! A configuration is validated once at load time and is read-only afterwards.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for EFISync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub endpoint: EndpointConfig,
    pub retry: RetryConfig,
    pub queue: QueueConfig,
    pub transfer: TransferConfig,
    pub media: MediaConfig,
    pub logging: LoggingConfig,
    pub receiver: ReceiverConfig,
}

/// Scan scheduling and sync job settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between scheduled sync cycles.
    pub interval_secs: u64,
    /// Delay between the two probes of the mid-write stability check.
    pub stability_delay_ms: u64,
    /// Glob patterns (matched against file names and relative paths) that are never synced.
    pub exclude: Vec<String>,
    /// Directory pairs kept in sync with the remote endpoint.
    pub jobs: Vec<SyncJob>,
    /// SQLite file holding the durable queue and the last-known record table.
    pub state_db: PathBuf,
    /// Number of cycle results kept in memory.
    pub history_size: usize,
}

/// Direction of a sync job relative to this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobDirection {
    /// Local files are sent to the remote endpoint.
    Push,
    /// Remote files are fetched into the local directory.
    Pull,
}

/// One local directory mirrored to or from a prefix on the remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJob {
    pub name: String,
    pub direction: JobDirection,
    pub local_root: PathBuf,
    /// Relative prefix under the receiver's root; empty means the root itself.
    #[serde(default)]
    pub remote_prefix: String,
}

/// The single remote endpoint this host syncs with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    /// Connect timeout of a reachability probe.
    pub probe_timeout_ms: u64,
    /// How long a probe result is trusted before a new probe is made.
    pub probe_ttl_secs: u64,
    /// Interval of the background probe timer.
    pub probe_interval_secs: u64,
    /// Read/write timeout on an established transfer connection.
    pub io_timeout_secs: u64,
}

/// In-call retry settings for a single claimed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts made within one claim before the task is nacked.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the computed delay added as random jitter (0.0 - 1.0).
    pub jitter: f64,
}

/// Operation queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Failed attempts after which a task becomes dead.
    pub max_task_attempts: u32,
    /// Depth above which the oldest dead tasks are evicted.
    pub max_depth: usize,
    /// Dead tasks older than this are purged at the start of a cycle.
    pub dead_task_max_age_secs: u64,
}

/// Transfer engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Size of each streamed chunk in KiB.
    pub chunk_size_kb: u64,
    /// zlib level for network transfers; 0 disables compression.
    pub compression_level: u32,
    /// Number of queue workers.
    pub workers: usize,
    /// Temp files older than this are removed at startup.
    pub orphan_temp_age_secs: u64,
    /// Re-read files written to removable media and compare fingerprints.
    pub verify_media_read_back: bool,
}

/// Removable-media reconciliation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub enabled: bool,
    /// Central archive that extracted files land in.
    pub archive_root: PathBuf,
    /// Archive sub-directory whose tree is mirrored onto managed volumes.
    pub inject_dir: String,
    /// Marker files or directories that identify a managed volume.
    pub markers: Vec<String>,
    /// Minimum number of markers that must be present.
    pub min_markers: usize,
    pub demo_dir: String,
    pub snapshot_dir: String,
    pub logbook_dir: String,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

/// Consumer-side receiver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub enabled: bool,
    pub listen: String,
    /// Directory pushed files are written under and pulled files are read from.
    pub root: PathBuf,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

/// Errors raised while loading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {}", join_errors(.0))]
    Invalid(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load and validate in one step; the only way the daemon obtains a config.
    pub fn load_validated(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/efisync/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("efisync")
            .join("config.yaml")
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("~/.local/share"))
        .join("efisync")
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// File patterns that are never synced unless a config overrides the list.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "*.tmp",
    "*.efisync-tmp-*",
    ".DS_Store",
    "._*",
    "Thumbs.db",
    "desktop.ini",
    ".Spotlight-V100",
    ".Trashes",
    ".fseventsd",
];

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 1800,
            stability_delay_ms: 500,
            exclude: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
            jobs: Vec::new(),
            state_db: data_dir().join("state.db"),
            history_size: 50,
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7420,
            probe_timeout_ms: 2000,
            probe_ttl_secs: 10,
            probe_interval_secs: 30,
            io_timeout_secs: 30,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter: 0.1,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_task_attempts: 5,
            max_depth: 1000,
            dead_task_max_age_secs: 24 * 60 * 60,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size_kb: 64,
            compression_level: 0,
            workers: 3,
            orphan_temp_age_secs: 3600,
            verify_media_read_back: true,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            archive_root: data_dir().join("archive"),
            inject_dir: "volume".to_string(),
            markers: vec![
                "EFIS_DRIVE.txt".to_string(),
                "NAV.DB".to_string(),
                "DEMO".to_string(),
                "SNAP".to_string(),
            ],
            min_markers: 2,
            demo_dir: "demo".to_string(),
            snapshot_dir: "snapshots".to_string(),
            logbook_dir: "logbook".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: "0.0.0.0:7420".to_string(),
            root: data_dir().join("inbox"),
        }
    }
}

// ---------------------------------------------------------------------------
// Duration accessors
// ---------------------------------------------------------------------------

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn stability_delay(&self) -> Duration {
        Duration::from_millis(self.stability_delay_ms)
    }
}

impl EndpointConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn probe_ttl(&self) -> Duration {
        Duration::from_secs(self.probe_ttl_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    /// `host:port` form used for connecting.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl QueueConfig {
    pub fn dead_task_max_age(&self) -> Duration {
        Duration::from_secs(self.dead_task_max_age_secs)
    }
}

impl TransferConfig {
    pub fn chunk_size(&self) -> usize {
        (self.chunk_size_kb as usize) * 1024
    }

    /// Compression level to use on the wire, `None` when disabled.
    pub fn compression(&self) -> Option<u32> {
        (self.compression_level > 0).then_some(self.compression_level)
    }

    pub fn orphan_temp_age(&self) -> Duration {
        Duration::from_secs(self.orphan_temp_age_secs)
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"sync.interval_secs"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Upper bound of the worker pool.
pub const MAX_WORKERS: usize = 4;

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut push = |field: &str, message: String| {
            errors.push(ValidationError {
                field: field.to_string(),
                message,
            });
        };

        // --- sync ---
        if self.sync.interval_secs == 0 {
            push("sync.interval_secs", "must be greater than 0".into());
        }
        if self.sync.history_size == 0 {
            push("sync.history_size", "must be greater than 0".into());
        }
        for pattern in &self.sync.exclude {
            if let Err(e) = glob::Pattern::new(pattern) {
                push("sync.exclude", format!("invalid pattern '{pattern}': {e}"));
            }
        }
        let mut names = std::collections::HashSet::new();
        for (i, job) in self.sync.jobs.iter().enumerate() {
            if job.name.trim().is_empty() {
                push(&format!("sync.jobs[{i}].name"), "must not be empty".into());
            } else if !names.insert(job.name.as_str()) {
                push(
                    &format!("sync.jobs[{i}].name"),
                    format!("duplicate job name '{}'", job.name),
                );
            }
            if job.local_root.as_os_str().is_empty() {
                push(
                    &format!("sync.jobs[{i}].local_root"),
                    "must not be empty".into(),
                );
            }
            if job.remote_prefix.starts_with('/') || job.remote_prefix.split('/').any(|c| c == "..")
            {
                push(
                    &format!("sync.jobs[{i}].remote_prefix"),
                    "must be a relative path without '..'".into(),
                );
            }
        }

        // --- endpoint ---
        if self.endpoint.host.trim().is_empty() {
            push("endpoint.host", "must not be empty".into());
        }
        if self.endpoint.port == 0 {
            push("endpoint.port", "must be greater than 0".into());
        }
        if self.endpoint.probe_timeout_ms == 0 {
            push("endpoint.probe_timeout_ms", "must be greater than 0".into());
        }
        if self.endpoint.probe_interval_secs == 0 {
            push("endpoint.probe_interval_secs", "must be greater than 0".into());
        }
        if self.endpoint.io_timeout_secs == 0 {
            push("endpoint.io_timeout_secs", "must be greater than 0".into());
        }

        // --- retry ---
        if self.retry.max_attempts == 0 {
            push("retry.max_attempts", "must be at least 1".into());
        }
        if self.retry.base_delay_ms == 0 {
            push("retry.base_delay_ms", "must be greater than 0".into());
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            push(
                "retry.max_delay_ms",
                "must not be smaller than retry.base_delay_ms".into(),
            );
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            push("retry.jitter", "must be between 0.0 and 1.0".into());
        }

        // --- queue ---
        if self.queue.max_task_attempts == 0 {
            push("queue.max_task_attempts", "must be at least 1".into());
        }
        if self.queue.max_depth == 0 {
            push("queue.max_depth", "must be greater than 0".into());
        }

        // --- transfer ---
        if self.transfer.chunk_size_kb == 0 {
            push("transfer.chunk_size_kb", "must be greater than 0".into());
        }
        if self.transfer.compression_level > 9 {
            push("transfer.compression_level", "must be between 0 and 9".into());
        }
        if self.transfer.workers == 0 || self.transfer.workers > MAX_WORKERS {
            push(
                "transfer.workers",
                format!("must be between 1 and {MAX_WORKERS}"),
            );
        }

        // --- media ---
        if self.media.enabled {
            if self.media.archive_root.as_os_str().is_empty() {
                push("media.archive_root", "must not be empty".into());
            }
            if self.media.min_markers == 0 {
                push("media.min_markers", "must be at least 1".into());
            }
            if self.media.min_markers > self.media.markers.len() {
                push(
                    "media.min_markers",
                    format!(
                        "requires {} markers but only {} are configured",
                        self.media.min_markers,
                        self.media.markers.len()
                    ),
                );
            }
            for (field, dir) in [
                ("media.inject_dir", &self.media.inject_dir),
                ("media.demo_dir", &self.media.demo_dir),
                ("media.snapshot_dir", &self.media.snapshot_dir),
                ("media.logbook_dir", &self.media.logbook_dir),
            ] {
                if dir.trim().is_empty() || dir.contains("..") || dir.starts_with('/') {
                    push(field, "must be a non-empty relative directory name".into());
                }
            }
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            push(
                "logging.level",
                format!(
                    "invalid level '{}'; expected one of: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            );
        }

        // --- receiver ---
        if self.receiver.enabled {
            if self.receiver.listen.parse::<SocketAddr>().is_err() {
                push(
                    "receiver.listen",
                    format!("not a socket address: {}", self.receiver.listen),
                );
            }
            if self.receiver.root.as_os_str().is_empty() {
                push("receiver.root", "must not be empty".into());
            }
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically, starting from defaults.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Start from [`Config::default`].
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- sync ---

    pub fn sync_interval_secs(mut self, seconds: u64) -> Self {
        self.config.sync.interval_secs = seconds;
        self
    }

    pub fn sync_stability_delay_ms(mut self, ms: u64) -> Self {
        self.config.sync.stability_delay_ms = ms;
        self
    }

    pub fn sync_exclude(mut self, patterns: Vec<String>) -> Self {
        self.config.sync.exclude = patterns;
        self
    }

    pub fn sync_job(mut self, job: SyncJob) -> Self {
        self.config.sync.jobs.push(job);
        self
    }

    pub fn sync_state_db(mut self, path: PathBuf) -> Self {
        self.config.sync.state_db = path;
        self
    }

    pub fn sync_history_size(mut self, n: usize) -> Self {
        self.config.sync.history_size = n;
        self
    }

    // --- endpoint ---

    pub fn endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.endpoint.host = host.into();
        self.config.endpoint.port = port;
        self
    }

    pub fn endpoint_probe_ttl_secs(mut self, seconds: u64) -> Self {
        self.config.endpoint.probe_ttl_secs = seconds;
        self
    }

    pub fn endpoint_probe_timeout_ms(mut self, ms: u64) -> Self {
        self.config.endpoint.probe_timeout_ms = ms;
        self
    }

    pub fn endpoint_probe_interval_secs(mut self, seconds: u64) -> Self {
        self.config.endpoint.probe_interval_secs = seconds;
        self
    }

    // --- retry ---

    pub fn retry_max_attempts(mut self, n: u32) -> Self {
        self.config.retry.max_attempts = n;
        self
    }

    pub fn retry_base_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry.base_delay_ms = ms;
        self
    }

    pub fn retry_max_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry.max_delay_ms = ms;
        self
    }

    pub fn retry_jitter(mut self, jitter: f64) -> Self {
        self.config.retry.jitter = jitter;
        self
    }

    // --- queue ---

    pub fn queue_max_task_attempts(mut self, n: u32) -> Self {
        self.config.queue.max_task_attempts = n;
        self
    }

    pub fn queue_max_depth(mut self, n: usize) -> Self {
        self.config.queue.max_depth = n;
        self
    }

    // --- transfer ---

    pub fn transfer_chunk_size_kb(mut self, kb: u64) -> Self {
        self.config.transfer.chunk_size_kb = kb;
        self
    }

    pub fn transfer_compression_level(mut self, level: u32) -> Self {
        self.config.transfer.compression_level = level;
        self
    }

    pub fn transfer_workers(mut self, n: usize) -> Self {
        self.config.transfer.workers = n;
        self
    }

    // --- media ---

    pub fn media_enabled(mut self, enabled: bool) -> Self {
        self.config.media.enabled = enabled;
        self
    }

    pub fn media_archive_root(mut self, root: PathBuf) -> Self {
        self.config.media.archive_root = root;
        self
    }

    pub fn media_min_markers(mut self, n: usize) -> Self {
        self.config.media.min_markers = n;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_json(mut self, json: bool) -> Self {
        self.config.logging.json = json;
        self
    }

    // --- receiver ---

    pub fn receiver(mut self, listen: impl Into<String>, root: PathBuf) -> Self {
        self.config.receiver.enabled = true;
        self.config.receiver.listen = listen.into();
        self.config.receiver.root = root;
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
