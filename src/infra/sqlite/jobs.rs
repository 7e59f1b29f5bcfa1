//! SQLite job queue
//!
//! Jobs are pulled with a single `UPDATE ... RETURNING` so two workers can
//! never take the same job.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePool, FromRow};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{parse_opt_ts, parse_ts, parse_uuid, ts};
use crate::domain::{Job, JobPayload};
use crate::infra::{retry_db, JobQueue, Result, RetryPolicy, SyncError};

const JOB_COLUMNS: &str = "id, queue, event_id, entity_id, attempts, max_attempts, status, \
     run_at, locked_at, last_error, created_at, updated_at";

/// SQLite-backed [`JobQueue`]
#[derive(Clone)]
pub struct SqliteJobQueue {
    pool: SqlitePool,
    /// Applied to enqueue and fetch, which race with every worker
    retry: RetryPolicy,
}

impl SqliteJobQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            retry: RetryPolicy::database(),
        }
    }

    async fn enqueue_once(
        &self,
        queue: &str,
        payload: &JobPayload,
        max_attempts: u32,
        run_at: DateTime<Utc>,
    ) -> Result<Job> {
        let id = Uuid::new_v4();
        let now = ts(Utc::now());

        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, queue, event_id, entity_id, attempts, max_attempts,
                status, run_at, created_at, updated_at
            )
            SELECT ?, ?, ?, ?, 0, ?, 'queued', ?, ?, ?
            WHERE NOT EXISTS (
                SELECT 1 FROM jobs WHERE queue = ? AND event_id = ? AND status = 'queued'
            )
            "#,
        )
        .bind(id.to_string())
        .bind(queue)
        .bind(payload.event_id.to_string())
        .bind(&payload.entity_id)
        .bind(max_attempts.max(1) as i64)
        .bind(ts(run_at))
        .bind(&now)
        .bind(&now)
        .bind(queue)
        .bind(payload.event_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(event_id = %payload.event_id, "Job already queued");
        }

        self.queued_for_event(queue, payload.event_id)
            .await?
            .ok_or_else(|| SyncError::Internal(format!("job for {} vanished", payload.event_id)))
    }

    async fn fetch_next_once(&self, queue: &str) -> Result<Option<Job>> {
        let now = ts(Utc::now());

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs
            SET status = 'running', attempts = attempts + 1, locked_at = ?, updated_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = ? AND status = 'queued' AND run_at <= ?
                ORDER BY run_at ASC, seq ASC
                LIMIT 1
            )
            AND status = 'queued'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(&now)
        .bind(&now)
        .bind(queue)
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn queued_for_event(&self, queue: &str, event_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE queue = ? AND event_id = ? AND status = 'queued' ORDER BY seq ASC LIMIT 1"
        ))
        .bind(queue)
        .bind(event_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn expect_running(&self, job_id: Uuid, rows_affected: u64, to: &str) -> Result<()> {
        if rows_affected == 1 {
            return Ok(());
        }
        match self.get(job_id).await? {
            Some(job) => Err(SyncError::Internal(format!(
                "job {job_id} is {} and cannot move to {to}",
                job.status
            ))),
            None => Err(SyncError::NotFound(format!("job {job_id}"))),
        }
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(
        &self,
        queue: &str,
        payload: &JobPayload,
        max_attempts: u32,
        run_at: DateTime<Utc>,
    ) -> Result<Job> {
        retry_db(&self.retry, "jobs.enqueue", || {
            self.enqueue_once(queue, payload, max_attempts, run_at)
        })
        .await
    }

    async fn fetch_next(&self, queue: &str) -> Result<Option<Job>> {
        retry_db(&self.retry, "jobs.fetch_next", || self.fetch_next_once(queue)).await
    }

    async fn mark_done(&self, job_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'done', locked_at = NULL, updated_at = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(ts(Utc::now()))
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;

        self.expect_running(job_id, result.rows_affected(), "done")
            .await
    }

    async fn retry_later(&self, job_id: Uuid, error: &str, run_at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', locked_at = NULL, last_error = ?, run_at = ?, updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(error)
        .bind(ts(run_at))
        .bind(ts(Utc::now()))
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;

        self.expect_running(job_id, result.rows_affected(), "queued")
            .await
    }

    async fn defer(&self, job_id: Uuid, run_at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', locked_at = NULL, attempts = MAX(attempts - 1, 0),
                run_at = ?, updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(ts(run_at))
        .bind(ts(Utc::now()))
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;

        self.expect_running(job_id, result.rows_affected(), "queued")
            .await
    }

    async fn mark_failed(&self, job_id: Uuid, error: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = 'failed', locked_at = NULL, last_error = ?, updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(error)
        .bind(ts(Utc::now()))
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            warn!(job_id = %job_id, error = error, "Job failed permanently");
        }
        self.expect_running(job_id, result.rows_affected(), "failed")
            .await
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"
        ))
        .bind(job_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn jobs_for_event(&self, event_id: Uuid) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE event_id = ? ORDER BY seq ASC"
        ))
        .bind(event_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn has_live_job(&self, event_id: Uuid) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM jobs WHERE event_id = ? AND status IN ('queued', 'running') LIMIT 1",
        )
        .bind(event_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn requeue_stale(&self, older_than: Duration) -> Result<u64> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| SyncError::Configuration(format!("stale timeout out of range: {e}")))?;
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = 'queued', locked_at = NULL, updated_at = ?
            WHERE status = 'running' AND locked_at < ?
            "#,
        )
        .bind(ts(now))
        .bind(ts(now - age))
        .execute(&self.pool)
        .await?;

        let count = result.rows_affected();
        if count > 0 {
            info!(count = count, "Requeued stale running jobs");
        }
        Ok(count)
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    queue: String,
    event_id: String,
    entity_id: String,
    attempts: i64,
    max_attempts: i64,
    status: String,
    run_at: String,
    locked_at: Option<String>,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<JobRow> for Job {
    type Error = SyncError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            id: parse_uuid(&row.id, "job id")?,
            queue: row.queue,
            event_id: parse_uuid(&row.event_id, "event id")?,
            entity_id: row.entity_id,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            status: row.status.parse()?,
            run_at: parse_ts(&row.run_at, "run_at")?,
            locked_at: parse_opt_ts(row.locked_at, "locked_at")?,
            last_error: row.last_error,
            created_at: parse_ts(&row.created_at, "created_at")?,
            updated_at: parse_ts(&row.updated_at, "updated_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobStatus, DISPATCH_QUEUE};
    use crate::infra::Store;

    fn payload() -> JobPayload {
        JobPayload {
            event_id: Uuid::new_v4(),
            entity_id: "C1".into(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_and_fetch() {
        let jobs = Store::in_memory().await.unwrap().jobs();
        let p = payload();
        let job = jobs.enqueue(DISPATCH_QUEUE, &p, 3, Utc::now()).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);

        let fetched = jobs.fetch_next(DISPATCH_QUEUE).await.unwrap().unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.status, JobStatus::Running);
        assert_eq!(fetched.attempts, 1);

        assert!(jobs.fetch_next(DISPATCH_QUEUE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_reuses_queued_job() {
        let jobs = Store::in_memory().await.unwrap().jobs();
        let p = payload();
        let a = jobs.enqueue(DISPATCH_QUEUE, &p, 3, Utc::now()).await.unwrap();
        let b = jobs.enqueue(DISPATCH_QUEUE, &p, 3, Utc::now()).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(jobs.jobs_for_event(p.event_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_future_jobs_are_not_due() {
        let jobs = Store::in_memory().await.unwrap().jobs();
        let later = Utc::now() + chrono::Duration::seconds(60);
        jobs.enqueue(DISPATCH_QUEUE, &payload(), 3, later)
            .await
            .unwrap();
        assert!(jobs.fetch_next(DISPATCH_QUEUE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_then_fail() {
        let jobs = Store::in_memory().await.unwrap().jobs();
        let p = payload();
        jobs.enqueue(DISPATCH_QUEUE, &p, 2, Utc::now()).await.unwrap();

        let job = jobs.fetch_next(DISPATCH_QUEUE).await.unwrap().unwrap();
        jobs.retry_later(job.id, "timeout", Utc::now()).await.unwrap();

        let job = jobs.fetch_next(DISPATCH_QUEUE).await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(job.last_error.as_deref(), Some("timeout"));
        jobs.mark_failed(job.id, "timeout").await.unwrap();

        let job = jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(!jobs.has_live_job(p.event_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_defer_does_not_count_attempt() {
        let jobs = Store::in_memory().await.unwrap().jobs();
        jobs.enqueue(DISPATCH_QUEUE, &payload(), 3, Utc::now())
            .await
            .unwrap();

        let job = jobs.fetch_next(DISPATCH_QUEUE).await.unwrap().unwrap();
        jobs.defer(job.id, Utc::now()).await.unwrap();
        let job = jobs.fetch_next(DISPATCH_QUEUE).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn test_mark_done_requires_running() {
        let jobs = Store::in_memory().await.unwrap().jobs();
        let job = jobs
            .enqueue(DISPATCH_QUEUE, &payload(), 3, Utc::now())
            .await
            .unwrap();
        assert!(jobs.mark_done(job.id).await.is_err());
        assert!(matches!(
            jobs.mark_done(Uuid::new_v4()).await.unwrap_err(),
            SyncError::NotFound(_)
        ));
    }
}
