//! SQLite-backed queue store.
//!
//! One database file holds two tables:
//!
//! - `tasks`: one row per task. `seq` is an autoincrement column used for
//!   insertion ordering; `task_id` is the public identifier.
//! - `task_errors`: the append-only failure history.
//!
//! Timestamps are stored as RFC 3339 text.
//!
//! The connection pool is opened lazily on first use and dropped by
//! [`close`](QueueStore::close); the next call reopens it. That lets the daemon
//! release the file between polling passes so other processes are never
//! blocked by an idle connection.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use sokrates_core::{ErrorRecord, NewTask, StatusUpdate, Task, TaskId, TaskStatus};

use super::{QueueStats, QueueStore, StoreError};

const TASK_COLUMNS: &str =
    "task_id, file_path, status, attempt_count, result, last_error, created_at, updated_at";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        seq           INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id       TEXT NOT NULL UNIQUE,
        file_path     TEXT NOT NULL,
        status        TEXT NOT NULL,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        result        TEXT NULL,
        last_error    TEXT NULL,
        created_at    TEXT NOT NULL,
        updated_at    TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status, seq)",
    r#"
    CREATE TABLE IF NOT EXISTS task_errors (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id     TEXT NOT NULL REFERENCES tasks (task_id),
        message     TEXT NOT NULL,
        attempt     INTEGER NOT NULL,
        created_at  TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_task_errors_task ON task_errors (task_id, id)",
];

/// SQLite-backed queue store.
///
/// Cheap to clone; clones share the same lazily opened pool.
#[derive(Debug, Clone)]
pub struct SqliteQueueStore {
    path: PathBuf,
    pool: Arc<tokio::sync::Mutex<Option<SqlitePool>>>,
}

impl SqliteQueueStore {
    /// Create a store for the database at `path` (opened on first use).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pool: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the pool, opening the database and creating the schema if needed.
    async fn pool(&self) -> Result<SqlitePool, StoreError> {
        let mut guard = self.pool.lock().await;
        if let Some(pool) = guard.as_ref() {
            return Ok(pool.clone());
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Storage(format!(
                    "failed to create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("open", e))?;

        for statement in SCHEMA {
            sqlx::query(*statement)
                .execute(&pool)
                .await
                .map_err(|e| map_sqlx_error("create_schema", e))?;
        }

        debug!(path = %self.path.display(), "opened task queue database");
        *guard = Some(pool.clone());
        Ok(pool)
    }
}

#[async_trait::async_trait]
impl QueueStore for SqliteQueueStore {
    #[instrument(skip(self, task), fields(task_id = %task.task_id))]
    async fn enqueue(&self, task: NewTask) -> Result<Task, StoreError> {
        let pool = self.pool().await?;
        let task = task.into_task(now());

        sqlx::query(
            r#"
            INSERT INTO tasks (task_id, file_path, status, attempt_count, result, last_error, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, NULL, NULL, ?5, ?6)
            "#,
        )
        .bind(task.task_id.to_string())
        .bind(task.file_path.to_string_lossy().into_owned())
        .bind(task.status.as_str())
        .bind(i64::from(task.attempt_count))
        .bind(format_timestamp(task.created_at))
        .bind(format_timestamp(task.updated_at))
        .execute(&pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::AlreadyExists(task.task_id)
            }
            other => map_sqlx_error("enqueue", other),
        })?;

        Ok(task)
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>, StoreError> {
        let pool = self.pool().await?;
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1"
        ))
        .bind(task_id.to_string())
        .fetch_optional(&pool)
        .await
        .map_err(|e| map_sqlx_error("get_task", e))?;

        row.as_ref().map(row_to_task).transpose()
    }

    async fn get_pending_tasks(&self, limit: Option<usize>) -> Result<Vec<Task>, StoreError> {
        let pool = self.pool().await?;
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY seq LIMIT ?2"
        ))
        .bind(TaskStatus::Pending.as_str())
        .bind(sql_limit(limit))
        .fetch_all(&pool)
        .await
        .map_err(|e| map_sqlx_error("get_pending_tasks", e))?;

        rows.iter().map(row_to_task).collect()
    }

    async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let pool = self.pool().await?;
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE (?1 IS NULL OR status = ?1) ORDER BY seq LIMIT ?2"
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(sql_limit(Some(limit)))
        .fetch_all(&pool)
        .await
        .map_err(|e| map_sqlx_error("list_tasks", e))?;

        rows.iter().map(row_to_task).collect()
    }

    #[instrument(skip(self, update), fields(to = %update.status))]
    async fn update_status(
        &self,
        task_id: TaskId,
        update: StatusUpdate,
    ) -> Result<Task, StoreError> {
        let pool = self.pool().await?;
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1"
        ))
        .bind(task_id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_status", e))?
        .ok_or(StoreError::NotFound(task_id))?;

        let mut task = row_to_task(&row)?;
        let expected = task.status;
        task.apply(&update, now())?;

        // Only write if nobody changed the status since we read it.
        let written = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?2, attempt_count = ?3, result = ?4, last_error = ?5, updated_at = ?6
            WHERE task_id = ?1 AND status = ?7
            "#,
        )
        .bind(task_id.to_string())
        .bind(task.status.as_str())
        .bind(i64::from(task.attempt_count))
        .bind(task.result.as_deref())
        .bind(task.last_error.as_deref())
        .bind(format_timestamp(task.updated_at))
        .bind(expected.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_status", e))?;

        if written.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::Conflict(task_id));
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        debug!(%task_id, from = %expected, to = %task.status, "task status written");
        Ok(task)
    }

    async fn append_error(&self, record: &ErrorRecord) -> Result<(), StoreError> {
        let pool = self.pool().await?;
        sqlx::query(
            r#"
            INSERT INTO task_errors (task_id, message, attempt, created_at)
            SELECT ?1, ?2, ?3, ?4
            WHERE EXISTS (SELECT 1 FROM tasks WHERE task_id = ?1)
            "#,
        )
        .bind(record.task_id.to_string())
        .bind(record.message.as_str())
        .bind(i64::from(record.attempt))
        .bind(format_timestamp(record.recorded_at))
        .execute(&pool)
        .await
        .map_err(|e| map_sqlx_error("append_error", e))
        .and_then(|done| {
            if done.rows_affected() == 0 {
                Err(StoreError::NotFound(record.task_id))
            } else {
                Ok(())
            }
        })
    }

    async fn list_errors(&self, task_id: TaskId) -> Result<Vec<ErrorRecord>, StoreError> {
        let pool = self.pool().await?;
        let rows = sqlx::query(
            "SELECT task_id, message, attempt, created_at FROM task_errors WHERE task_id = ?1 ORDER BY id",
        )
        .bind(task_id.to_string())
        .fetch_all(&pool)
        .await
        .map_err(|e| map_sqlx_error("list_errors", e))?;

        rows.iter()
            .map(|row| -> Result<ErrorRecord, StoreError> {
                Ok(ErrorRecord {
                    task_id: parse_column(row, "task_id")?,
                    message: row.try_get("message").map_err(corrupt)?,
                    attempt: u32_column(row, "attempt")?,
                    recorded_at: timestamp_column(row, "created_at")?,
                })
            })
            .collect()
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let pool = self.pool().await?;
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status")
            .fetch_all(&pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: TaskStatus = parse_column(&row, "status")?;
            let count: i64 = row.try_get("n").map_err(corrupt)?;
            stats.add(status, usize::try_from(count).unwrap_or(0));
        }
        Ok(stats)
    }

    async fn close(&self) {
        let pool = self.pool.lock().await.take();
        if let Some(pool) = pool {
            pool.close().await;
            debug!(path = %self.path.display(), "closed task queue database");
        }
    }
}

fn row_to_task(row: &SqliteRow) -> Result<Task, StoreError> {
    let file_path: String = row.try_get("file_path").map_err(corrupt)?;
    Ok(Task {
        task_id: parse_column(row, "task_id")?,
        file_path: PathBuf::from(file_path),
        status: parse_column(row, "status")?,
        attempt_count: u32_column(row, "attempt_count")?,
        result: row.try_get("result").map_err(corrupt)?,
        last_error: row.try_get("last_error").map_err(corrupt)?,
        created_at: timestamp_column(row, "created_at")?,
        updated_at: timestamp_column(row, "updated_at")?,
    })
}

fn parse_column<T>(row: &SqliteRow, column: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column).map_err(corrupt)?;
    raw.parse()
        .map_err(|e| StoreError::Corrupt(format!("{column}: {e}")))
}

fn u32_column(row: &SqliteRow, column: &str) -> Result<u32, StoreError> {
    let raw: i64 = row.try_get(column).map_err(corrupt)?;
    u32::try_from(raw).map_err(|_| StoreError::Corrupt(format!("{column} out of range: {raw}")))
}

fn timestamp_column(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>, StoreError> {
    let raw: String = row.try_get(column).map_err(corrupt)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("{column}: {e}")))
}

/// Current time at the precision timestamps are stored with, so returned
/// tasks compare equal to what a later read yields.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// SQLite treats a negative LIMIT as "no limit".
fn sql_limit(limit: Option<usize>) -> i64 {
    limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX))
}

fn corrupt(err: sqlx::Error) -> StoreError {
    StoreError::Corrupt(err.to_string())
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            StoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed during {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Storage(format!("timed out waiting for a connection in {operation}"))
        }
        other => StoreError::Storage(format!("{operation} failed: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, SqliteQueueStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteQueueStore::new(dir.path().join("queue").join("tasks.db"));
        (dir, store)
    }

    #[tokio::test]
    async fn enqueued_tasks_survive_a_reopen() {
        let (_dir, store) = temp_store();
        let task = store.enqueue(NewTask::new("/tmp/job.json")).await.unwrap();
        store.close().await;

        let reopened = SqliteQueueStore::new(store.path());
        let loaded = reopened.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(loaded.task_id, task.task_id);
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.attempt_count, 0);
        assert_eq!(loaded.file_path, PathBuf::from("/tmp/job.json"));
        reopened.close().await;
    }

    #[tokio::test]
    async fn pending_tasks_follow_insertion_order_and_limit() {
        let (_dir, store) = temp_store();
        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(
                store
                    .enqueue(NewTask::new(format!("/tmp/{i}.json")))
                    .await
                    .unwrap()
                    .task_id,
            );
        }
        store
            .update_status(ids[1], StatusUpdate::new(TaskStatus::InProgress).with_attempt(1))
            .await
            .unwrap();

        let all: Vec<_> = store
            .get_pending_tasks(None)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.task_id)
            .collect();
        assert_eq!(all, vec![ids[0], ids[2], ids[3]]);

        let limited = store.get_pending_tasks(Some(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].task_id, ids[0]);
    }

    #[tokio::test]
    async fn status_writes_follow_the_transition_table() {
        let (_dir, store) = temp_store();
        let enqueued = store.enqueue(NewTask::new("/tmp/a.json")).await.unwrap();
        let id = enqueued.task_id;

        let err = store
            .update_status(id, StatusUpdate::new(TaskStatus::Completed).with_result("nope"))
            .await
            .unwrap_err();
        assert!(err.is_invalid_transition());

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let started = store
            .update_status(id, StatusUpdate::new(TaskStatus::InProgress).with_attempt(1))
            .await
            .unwrap();
        assert!(started.updated_at > enqueued.updated_at);
        assert_eq!(started.created_at, enqueued.created_at);

        let failed = store
            .update_status(id, StatusUpdate::new(TaskStatus::Failed).with_result("timeout"))
            .await
            .unwrap();
        assert_eq!(failed.last_error.as_deref(), Some("timeout"));
        assert!(failed.updated_at >= started.updated_at);

        let reread = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(reread.status, TaskStatus::Failed);
        assert_eq!(reread.result.as_deref(), Some("timeout"));
        assert_eq!(reread.updated_at, failed.updated_at);

        let dead = store
            .update_status(
                id,
                StatusUpdate::new(TaskStatus::DeadLetter).with_result("gave up"),
            )
            .await
            .unwrap();
        assert_eq!(dead.status, TaskStatus::DeadLetter);
        assert_eq!(dead.attempt_count, 1);

        let stored = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(stored, dead);
    }

    #[tokio::test]
    async fn unknown_task_update_is_not_found() {
        let (_dir, store) = temp_store();
        let err = store
            .update_status(TaskId::new(), StatusUpdate::new(TaskStatus::InProgress))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn duplicate_task_id_is_rejected() {
        let (_dir, store) = temp_store();
        let id = TaskId::new();
        store
            .enqueue(NewTask::new("/tmp/a.json").with_id(id))
            .await
            .unwrap();
        let err = store
            .enqueue(NewTask::new("/tmp/b.json").with_id(id))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn error_history_is_append_only_and_ordered() {
        let (_dir, store) = temp_store();
        let id = store.enqueue(NewTask::new("/tmp/a.json")).await.unwrap().task_id;

        store.append_error(&ErrorRecord::new(id, "first", 1)).await.unwrap();
        store.append_error(&ErrorRecord::new(id, "second", 2)).await.unwrap();

        let errors = store.list_errors(id).await.unwrap();
        let messages: Vec<_> = errors.iter().map(|e| (e.message.as_str(), e.attempt)).collect();
        assert_eq!(messages, vec![("first", 1), ("second", 2)]);

        let orphan = store
            .append_error(&ErrorRecord::new(TaskId::new(), "lost", 1))
            .await
            .unwrap_err();
        assert!(matches!(orphan, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn stats_and_filtered_listing() {
        let (_dir, store) = temp_store();
        let a = store.enqueue(NewTask::new("/tmp/a.json")).await.unwrap().task_id;
        store.enqueue(NewTask::new("/tmp/b.json")).await.unwrap();
        store
            .update_status(a, StatusUpdate::new(TaskStatus::InProgress).with_attempt(1))
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.in_progress, 1);
        assert_eq!(stats.total(), 2);

        let running = store
            .list_tasks(Some(TaskStatus::InProgress), 10)
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].task_id, a);
        assert_eq!(store.list_tasks(None, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_store_reopens() {
        let (_dir, store) = temp_store();
        store.close().await;
        store.enqueue(NewTask::new("/tmp/a.json")).await.unwrap();
        store.close().await;
        store.close().await;
        assert_eq!(store.stats().await.unwrap().pending, 1);
    }
}
