//! The durable task table: `active_tasks`, keyed by `task_id`, carrying the
//! deadline, next-run time, lock pair, and escalation step. Every operation
//! here is atomic from the caller's view; nothing above this module is
//! allowed to touch the database directly.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Row, SqlitePool};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::clock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} already exists")]
    Conflict(i64),
    #[error("store error: {0}")]
    Internal(#[from] sqlx::Error),
}

#[derive(Debug, Clone, FromRow, PartialEq, Eq)]
pub struct TaskRecord {
    pub task_id: i64,
    pub due: String,
    pub next_run_at: String,
    pub processing: bool,
    pub locked_at: Option<String>,
    pub step: i64,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if absent) the SQLite database at `path` with WAL
    /// journaling and a 30-second busy timeout, one connection per operation
    /// (spec.md §4.1 "Isolation").
    pub async fn connect(path: &str) -> Result<Self, StoreError> {
        let base = if path == ":memory:" {
            SqliteConnectOptions::new().in_memory(true)
        } else {
            SqliteConnectOptions::new().filename(path).create_if_missing(true)
        };
        let options = base
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Idempotently creates the schema. No-op on an already-migrated database.
    pub async fn initialize(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn insert(&self, task_id: i64, due: &str, next_run_at: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO active_tasks (task_id, due, next_run_at, processing, step) \
             SELECT ?, ?, ?, 0, 1 WHERE NOT EXISTS (SELECT 1 FROM active_tasks WHERE task_id = ?)",
        )
        .bind(task_id)
        .bind(due)
        .bind(next_run_at)
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(task_id));
        }
        Ok(())
    }

    pub async fn exists(&self, task_id: i64) -> Result<bool, StoreError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM active_tasks WHERE task_id = ?")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    /// Oversamples `5 * limit` rows ordered by `next_run_at`, skipping any
    /// whose timestamp fails to parse, then truncates to `limit`.
    pub async fn fetch_candidates(&self, limit: i64) -> Result<Vec<i64>, StoreError> {
        let now = clock::to_iso(Utc::now());
        let oversample = limit.saturating_mul(5).max(limit);

        let rows = sqlx::query(
            "SELECT task_id, next_run_at FROM active_tasks \
             WHERE processing = 0 AND next_run_at <= ? \
             ORDER BY next_run_at ASC LIMIT ?",
        )
        .bind(&now)
        .bind(oversample)
        .fetch_all(&self.pool)
        .await?;

        let mut candidates = Vec::with_capacity(limit as usize);
        for row in rows {
            if candidates.len() as i64 >= limit {
                break;
            }
            let task_id: i64 = row.try_get("task_id")?;
            let next_run_at: String = row.try_get("next_run_at")?;
            if clock::parse_iso_to_utc(&next_run_at).is_err() {
                warn!(task_id, next_run_at, "skipping candidate with unparseable next_run_at");
                continue;
            }
            candidates.push(task_id);
        }
        Ok(candidates)
    }

    /// Atomic CAS: `processing` 0 → 1. Returns true iff this call won the lock.
    pub async fn try_lock(&self, task_id: i64) -> Result<bool, StoreError> {
        let now = clock::to_iso(Utc::now());
        let result = sqlx::query(
            "UPDATE active_tasks SET processing = 1, locked_at = ? WHERE task_id = ? AND processing = 0",
        )
        .bind(&now)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn unlock(&self, task_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE active_tasks SET processing = 0, locked_at = NULL WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Sets `step`, advances `next_run_at` to the next 10:40 in `tz` (falling
    /// back to UTC if `tz` cannot be resolved upstream), and releases the lock
    /// — all in one statement.
    pub async fn bump_step_and_reschedule(
        &self,
        task_id: i64,
        new_step: i64,
        tz: Tz,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let next_run_at = clock::to_iso(clock::next_local_time_today_or_tomorrow(tz, 10, 40, now));
        sqlx::query(
            "UPDATE active_tasks SET step = ?, next_run_at = ?, processing = 0, locked_at = NULL \
             WHERE task_id = ?",
        )
        .bind(new_step)
        .bind(&next_run_at)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_step(&self, task_id: i64, new_step: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE active_tasks SET step = ? WHERE task_id = ?")
            .bind(new_step)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_row(&self, task_id: i64) -> Result<Option<TaskRecord>, StoreError> {
        let row = sqlx::query_as::<_, TaskRecord>("SELECT * FROM active_tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn delete(&self, task_id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM active_tasks WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Unlocks every row whose lock predates `now - lock_expiry_minutes`.
    /// The sole mechanism that breaks a crashed worker's lock.
    pub async fn recover_stale_locks(&self, lock_expiry_minutes: i64) -> Result<Vec<i64>, StoreError> {
        let cutoff = clock::to_iso(Utc::now() - chrono::Duration::minutes(lock_expiry_minutes));

        let stale: Vec<(i64,)> = sqlx::query_as(
            "SELECT task_id FROM active_tasks WHERE processing = 1 AND locked_at <= ?",
        )
        .bind(&cutoff)
        .fetch_all(&self.pool)
        .await?;

        if stale.is_empty() {
            return Ok(Vec::new());
        }

        sqlx::query("UPDATE active_tasks SET processing = 0, locked_at = NULL WHERE processing = 1 AND locked_at <= ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?;

        let ids: Vec<i64> = stale.into_iter().map(|(id,)| id).collect();
        info!(recovered = ids.len(), ids = ?ids, "recovered stale locks");
        Ok(ids)
    }
}
