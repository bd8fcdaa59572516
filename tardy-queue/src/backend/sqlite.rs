//! SQLite-backed job store.
//!
//! Timestamps are stored as UTC milliseconds. The claim is a single
//! conditional `UPDATE`, so SQLite's write serialization gives at most one
//! claimant per row.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::debug;

use crate::{
    backend::{CandidateQuery, JobStore},
    types::{Eligibility, QueueFilter},
    JobId, JobRecord, NewJob, QueueError, QueueResult,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tardy_jobs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    queue       TEXT NULL,
    priority    INTEGER NOT NULL DEFAULT 0,
    payload     TEXT NOT NULL,
    attempts    INTEGER NOT NULL DEFAULT 0,
    last_error  TEXT NULL,
    run_at      INTEGER NOT NULL,
    locked_at   INTEGER NULL,
    locked_by   TEXT NULL,
    failed_at   INTEGER NULL,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL
)
"#;

const PRIORITY_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS tardy_jobs_priority ON tardy_jobs (priority, run_at)";

const COLUMNS: &str =
    "id, queue, priority, payload, attempts, last_error, run_at, locked_at, locked_by, failed_at, created_at, updated_at";

/// Job store over a SQLite connection pool
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and create the jobs table if it is missing
    pub async fn connect(url: &str) -> QueueResult<Self> {
        // Every connection to an in-memory database opens a fresh database
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        debug!(url, "sqlite job store ready");
        Ok(store)
    }

    /// Wrap an existing pool; call [`SqliteStore::migrate`] before use
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> QueueResult<()> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        sqlx::query(PRIORITY_INDEX).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(millis: i64) -> QueueResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| QueueError::Store(format!("timestamp out of range: {}", millis)))
}

fn opt_from_millis(millis: Option<i64>) -> QueueResult<Option<DateTime<Utc>>> {
    millis.map(from_millis).transpose()
}

fn record_from_row(row: &SqliteRow) -> QueueResult<JobRecord> {
    let attempts: i64 = row.try_get("attempts")?;
    Ok(JobRecord {
        id: JobId(row.try_get("id")?),
        queue: row.try_get("queue")?,
        priority: row.try_get("priority")?,
        payload: row.try_get("payload")?,
        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        last_error: row.try_get("last_error")?,
        run_at: from_millis(row.try_get("run_at")?)?,
        locked_at: opt_from_millis(row.try_get("locked_at")?)?,
        locked_by: row.try_get("locked_by")?,
        failed_at: opt_from_millis(row.try_get("failed_at")?)?,
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn create(&self, job: NewJob) -> QueueResult<JobRecord> {
        let now = Utc::now();
        let run_at = job.run_at.unwrap_or(now);

        let result = sqlx::query(
            r#"
            INSERT INTO tardy_jobs (
                queue, priority, payload, attempts, run_at, locked_at, locked_by, failed_at, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            "#,
        )
        .bind(&job.queue)
        .bind(job.priority)
        .bind(&job.payload)
        .bind(i64::from(job.attempts))
        .bind(to_millis(run_at))
        .bind(job.locked_at.map(to_millis))
        .bind(&job.locked_by)
        .bind(job.failed_at.map(to_millis))
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        let id = JobId(result.last_insert_rowid());
        self.find(id)
            .await?
            .ok_or_else(|| QueueError::Store(format!("inserted job {} could not be read back", id)))
    }

    async fn find(&self, id: JobId) -> QueueResult<Option<JobRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM tardy_jobs WHERE id = ?1", COLUMNS))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn candidates(&self, query: &CandidateQuery<'_>) -> QueueResult<Vec<JobRecord>> {
        let eligibility = &query.eligibility;
        let queue = match query.queue {
            QueueFilter::Named(name) => Some(name.as_str()),
            QueueFilter::Any => None,
        };

        let sql = format!(
            r#"
            SELECT {} FROM tardy_jobs
            WHERE failed_at IS NULL
              AND run_at <= ?1
              AND (locked_at IS NULL OR locked_at < ?2 OR locked_by = ?3)
              AND (?4 IS NULL OR queue = ?4)
              AND (?5 IS NULL OR priority >= ?5)
              AND (?6 IS NULL OR priority <= ?6)
            ORDER BY priority ASC, run_at ASC, id ASC
            LIMIT ?7
            "#,
            COLUMNS
        );

        let rows = sqlx::query(&sql)
            .bind(to_millis(eligibility.now))
            .bind(eligibility.stale_before.map(to_millis))
            .bind(eligibility.worker_name)
            .bind(queue)
            .bind(query.priority_range.min)
            .bind(query.priority_range.max)
            .bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn claim(&self, id: JobId, eligibility: &Eligibility<'_>) -> QueueResult<Option<JobRecord>> {
        let now = to_millis(eligibility.now);
        let result = sqlx::query(
            r#"
            UPDATE tardy_jobs
            SET locked_by = ?1, locked_at = ?2, updated_at = ?2
            WHERE id = ?3
              AND failed_at IS NULL
              AND run_at <= ?2
              AND (locked_at IS NULL OR locked_at < ?4 OR locked_by = ?1)
            "#,
        )
        .bind(eligibility.worker_name)
        .bind(now)
        .bind(id.0)
        .bind(eligibility.stale_before.map(to_millis))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.find(id).await
    }

    async fn update(&self, record: &JobRecord) -> QueueResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE tardy_jobs
            SET queue = ?1, priority = ?2, attempts = ?3, last_error = ?4, run_at = ?5,
                locked_at = ?6, locked_by = ?7, failed_at = ?8, updated_at = ?9
            WHERE id = ?10
            "#,
        )
        .bind(&record.queue)
        .bind(record.priority)
        .bind(i64::from(record.attempts))
        .bind(&record.last_error)
        .bind(to_millis(record.run_at))
        .bind(record.locked_at.map(to_millis))
        .bind(&record.locked_by)
        .bind(record.failed_at.map(to_millis))
        .bind(to_millis(Utc::now()))
        .bind(record.id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::JobNotFound(record.id.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, id: JobId) -> QueueResult<bool> {
        let result = sqlx::query("DELETE FROM tardy_jobs WHERE id = ?1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear_locks(&self, worker_name: &str) -> QueueResult<u64> {
        let result = sqlx::query("UPDATE tardy_jobs SET locked_by = NULL, locked_at = NULL WHERE locked_by = ?1")
            .bind(worker_name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count(&self) -> QueueResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tardy_jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn delete_all(&self) -> QueueResult<u64> {
        let result = sqlx::query("DELETE FROM tardy_jobs").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn mark_failed(&self, id: JobId, at: DateTime<Utc>) -> QueueResult<()> {
        let result = sqlx::query("UPDATE tardy_jobs SET failed_at = ?1, updated_at = ?1 WHERE id = ?2")
            .bind(to_millis(at))
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::JobNotFound(id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PriorityRange;
    use std::time::Duration;

    const MAX_RUN_TIME: Duration = Duration::from_secs(120);

    async fn store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let store = store().await;
        let job = store
            .create(NewJob::new(r#"{"job_type":"x"}"#).with_queue("mail").with_priority(3))
            .await
            .unwrap();

        let found = store.find(job.id).await.unwrap().unwrap();
        assert_eq!(found.queue.as_deref(), Some("mail"));
        assert_eq!(found.priority, 3);
        assert_eq!(found.payload, r#"{"job_type":"x"}"#);
        assert!(!found.is_locked());
    }

    #[tokio::test]
    async fn test_candidates_respect_queue_and_priority() {
        let store = store().await;
        store.create(NewJob::new("{}").with_queue("mail").with_priority(5)).await.unwrap();
        let low = store.create(NewJob::new("{}").with_queue("mail").with_priority(1)).await.unwrap();
        store.create(NewJob::new("{}").with_queue("other")).await.unwrap();

        let mail = QueueFilter::Named("mail".into());
        let query = CandidateQuery {
            eligibility: Eligibility::new(Utc::now(), MAX_RUN_TIME, "w"),
            queue: &mail,
            priority_range: PriorityRange::new(None, Some(2)),
            limit: 5,
        };
        let found = store.candidates(&query).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, low.id);
    }

    #[tokio::test]
    async fn test_claim_rejects_fresh_foreign_lock() {
        let store = store().await;
        let now = Utc::now();
        let job = store.create(NewJob::new("{}").with_lock("other", now)).await.unwrap();

        let claimed = store.claim(job.id, &Eligibility::new(now, MAX_RUN_TIME, "me")).await.unwrap();
        assert!(claimed.is_none());

        let stale = now + chrono::Duration::minutes(5);
        let claimed = store.claim(job.id, &Eligibility::new(stale, MAX_RUN_TIME, "me")).await.unwrap();
        assert_eq!(claimed.unwrap().locked_by.as_deref(), Some("me"));
    }

    #[tokio::test]
    async fn test_update_and_mark_failed() {
        let store = store().await;
        let mut job = store.create(NewJob::new("{}")).await.unwrap();
        job.attempts = 2;
        job.last_error = Some("boom".into());
        store.update(&job).await.unwrap();

        let at = Utc::now();
        store.mark_failed(job.id, at).await.unwrap();
        let found = store.find(job.id).await.unwrap().unwrap();
        assert_eq!(found.attempts, 2);
        assert_eq!(found.last_error.as_deref(), Some("boom"));
        assert_eq!(found.failed_at.map(|t| t.timestamp_millis()), Some(at.timestamp_millis()));
    }

    #[tokio::test]
    async fn test_clear_locks_count_and_delete_all() {
        let store = store().await;
        let now = Utc::now();
        store.create(NewJob::new("{}").with_lock("w1", now)).await.unwrap();
        store.create(NewJob::new("{}").with_lock("w2", now)).await.unwrap();

        assert_eq!(store.clear_locks("w1").await.unwrap(), 1);
        assert_eq!(store.count().await.unwrap(), 2);
        assert_eq!(store.delete_all().await.unwrap(), 2);
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
