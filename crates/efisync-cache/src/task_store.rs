//! SQLite implementation of ITaskStore
//!
//! ## Type Mapping
//!
//! | Domain Type      | SQL Type | Strategy                                   |
//! |------------------|----------|--------------------------------------------|
//! | TaskId           | TEXT     | UUID string via `.to_string()` / `FromStr` |
//! | TaskKind         | TEXT     | `.as_str()` / `FromStr`                    |
//! | TaskState        | TEXT     | `.as_str()` / `FromStr`                    |
//! | FileRecord       | TEXT     | serde_json serialization                   |
//! | TaskError        | TEXT     | serde_json serialization                   |
//! | DateTime<Utc>    | TEXT     | RFC 3339 with nanoseconds                  |

use std::str::FromStr;

use efisync_core::domain::{TaskId, TaskKind, TaskState, TransferTask};
use efisync_core::ports::ITaskStore;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::{format_datetime, parse_datetime, CacheError};

/// Durable backing of the operation queue
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Number of stored tasks in `state`
    pub async fn count_in_state(&self, state: TaskState) -> Result<u64, CacheError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transfer_tasks WHERE state = ?")
            .bind(state.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

fn task_from_row(row: &SqliteRow) -> Result<TransferTask, CacheError> {
    let id: String = row.get("id");
    let sequence: i64 = row.get("sequence");
    let kind: String = row.get("kind");
    let state: String = row.get("state");
    let record: String = row.get("record");
    let attempts: i64 = row.get("attempts");
    let last_error: Option<String> = row.get("last_error");
    let enqueued_at: String = row.get("enqueued_at");
    let next_attempt_at: Option<String> = row.get("next_attempt_at");

    let serialization = |e: &dyn std::fmt::Display| CacheError::SerializationError(e.to_string());

    Ok(TransferTask {
        id: TaskId::from_str(&id).map_err(|e| serialization(&e))?,
        sequence: sequence as u64,
        kind: TaskKind::from_str(&kind).map_err(|e| serialization(&e))?,
        state: TaskState::from_str(&state).map_err(|e| serialization(&e))?,
        source: row.get("source"),
        destination: row.get("destination"),
        record: serde_json::from_str(&record).map_err(|e| serialization(&e))?,
        attempts: attempts as u32,
        last_error: last_error
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| serialization(&e))?,
        enqueued_at: parse_datetime(&enqueued_at)?,
        next_attempt_at: next_attempt_at.as_deref().map(parse_datetime).transpose()?,
    })
}

#[async_trait::async_trait]
impl ITaskStore for SqliteTaskStore {
    async fn upsert(&self, task: &TransferTask) -> anyhow::Result<()> {
        let record = serde_json::to_string(&task.record)
            .map_err(|e| anyhow::anyhow!("Failed to serialize record: {}", e))?;
        let last_error = match &task.last_error {
            Some(err) => Some(
                serde_json::to_string(err)
                    .map_err(|e| anyhow::anyhow!("Failed to serialize last_error: {}", e))?,
            ),
            None => None,
        };

        sqlx::query(
            "INSERT OR REPLACE INTO transfer_tasks \
             (id, sequence, kind, state, source, destination, record, \
              attempts, last_error, enqueued_at, next_attempt_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(task.id.to_string())
        .bind(task.sequence as i64)
        .bind(task.kind.as_str())
        .bind(task.state.as_str())
        .bind(&task.source)
        .bind(&task.destination)
        .bind(&record)
        .bind(i64::from(task.attempts))
        .bind(&last_error)
        .bind(format_datetime(&task.enqueued_at))
        .bind(task.next_attempt_at.as_ref().map(format_datetime))
        .execute(&self.pool)
        .await?;

        tracing::trace!(task_id = %task.id, state = %task.state, "Saved task");
        Ok(())
    }

    async fn remove(&self, id: &TaskId) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM transfer_tasks WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        tracing::trace!(task_id = %id, "Deleted task");
        Ok(())
    }

    async fn load_all(&self) -> anyhow::Result<Vec<TransferTask>> {
        let rows = sqlx::query("SELECT * FROM transfer_tasks ORDER BY sequence ASC")
            .fetch_all(&self.pool)
            .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            tasks.push(task_from_row(row)?);
        }
        Ok(tasks)
    }
}
