//! EFISync Cache - Local state persistence
//!
//! SQLite-based storage for:
//! - The operation queue (every un-acknowledged transfer task)
//! - The Change Detector's last-known file records per tree
//!
//! ## Architecture
//!
//! This crate implements the `ITaskStore` and `IRecordStore` ports from
//! `efisync-core`. It is a driven (secondary) adapter; nothing in the sync
//! core depends on it directly.
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use efisync_cache::{DatabasePool, SqliteRecordStore, SqliteTaskStore};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let pool = DatabasePool::new(Path::new("/var/lib/efisync/state.db")).await?;
//! let tasks = SqliteTaskStore::new(pool.pool().clone());
//! let records = SqliteRecordStore::new(pool.pool().clone());
//! # Ok(())
//! # }
//! ```

pub mod pool;
pub mod record_store;
pub mod task_store;

pub use pool::DatabasePool;
pub use record_store::SqliteRecordStore;
pub use task_store::SqliteTaskStore;

use chrono::{DateTime, SecondsFormat, Utc};

/// Errors that can occur during cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Failed to establish a database connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A database query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// A stored row could not be turned back into a domain value
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::QueryFailed(e.to_string())
    }
}

/// Timestamps keep nanoseconds; the detector compares them exactly
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, CacheError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            CacheError::SerializationError(format!("Failed to parse datetime '{}': {}", s, e))
        })
}
