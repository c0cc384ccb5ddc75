//! SQLite implementation of IRecordStore

use chrono::{DateTime, Utc};
use efisync_core::domain::{FileRecord, Fingerprint, RecordPath};
use efisync_core::ports::{IRecordStore, RecordMap};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::{format_datetime, parse_datetime, CacheError};

/// Last-known file records, one table partitioned by root key
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn record_from_row(row: &SqliteRow) -> Result<FileRecord, CacheError> {
    let path: String = row.get("path");
    let size: i64 = row.get("size");
    let fingerprint: String = row.get("fingerprint");
    let modified: String = row.get("modified");

    let path =
        RecordPath::new(path).map_err(|e| CacheError::SerializationError(e.to_string()))?;
    let fingerprint = Fingerprint::new(fingerprint)
        .map_err(|e| CacheError::SerializationError(e.to_string()))?;
    let modified: DateTime<Utc> = parse_datetime(&modified)?;
    Ok(FileRecord::new(path, size as u64, fingerprint, modified))
}

#[async_trait::async_trait]
impl IRecordStore for SqliteRecordStore {
    async fn load(&self, root_key: &str) -> anyhow::Result<RecordMap> {
        let rows = sqlx::query("SELECT * FROM file_records WHERE root_key = ?")
            .bind(root_key)
            .fetch_all(&self.pool)
            .await?;

        let mut records = RecordMap::with_capacity(rows.len());
        for row in &rows {
            let record = record_from_row(row)?;
            records.insert(record.path.clone(), record);
        }
        Ok(records)
    }

    async fn apply(
        &self,
        root_key: &str,
        upserts: &[FileRecord],
        removals: &[RecordPath],
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        for record in upserts {
            sqlx::query(
                "INSERT INTO file_records (root_key, path, size, fingerprint, modified) \
                 VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT(root_key, path) DO UPDATE SET \
                 size = excluded.size, fingerprint = excluded.fingerprint, \
                 modified = excluded.modified",
            )
            .bind(root_key)
            .bind(record.path.as_str())
            .bind(record.size as i64)
            .bind(record.fingerprint.as_str())
            .bind(format_datetime(&record.modified))
            .execute(&mut *tx)
            .await?;
        }

        for path in removals {
            sqlx::query("DELETE FROM file_records WHERE root_key = ? AND path = ?")
                .bind(root_key)
                .bind(path.as_str())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        tracing::trace!(
            root_key,
            upserts = upserts.len(),
            removals = removals.len(),
            "Applied record changes"
        );
        Ok(())
    }
}
