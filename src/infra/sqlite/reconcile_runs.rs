//! Persisted reconciliation run records

use chrono::Utc;
use sqlx::{sqlite::SqlitePool, FromRow};
use uuid::Uuid;

use super::{parse_opt_ts, parse_ts, parse_uuid, ts};
use crate::domain::{ReconcileRun, ReconcileRunStatus, ReconcileTotals};
use crate::infra::{Result, SyncError};

#[derive(Clone)]
pub struct SqliteReconcileRunStore {
    pool: SqlitePool,
}

impl SqliteReconcileRunStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a run as started
    pub async fn start(&self, job_name: &str) -> Result<ReconcileRun> {
        let run = ReconcileRun {
            id: Uuid::new_v4(),
            job_name: job_name.to_string(),
            status: ReconcileRunStatus::Running,
            totals: ReconcileTotals::default(),
            started_at: Utc::now(),
            finished_at: None,
            error_message: None,
        };

        sqlx::query(
            r#"
            INSERT INTO reconcile_runs (id, job_name, status, totals, started_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(run.id.to_string())
        .bind(&run.job_name)
        .bind(run.status.as_str())
        .bind(serde_json::to_string(&run.totals)?)
        .bind(ts(run.started_at))
        .execute(&self.pool)
        .await?;

        Ok(run)
    }

    /// Close a run with its final totals
    pub async fn finish(
        &self,
        run_id: Uuid,
        status: ReconcileRunStatus,
        totals: &ReconcileTotals,
        error_message: Option<&str>,
    ) -> Result<ReconcileRun> {
        let result = sqlx::query(
            r#"
            UPDATE reconcile_runs
            SET status = ?, totals = ?, finished_at = ?, error_message = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(status.as_str())
        .bind(serde_json::to_string(totals)?)
        .bind(ts(Utc::now()))
        .bind(error_message)
        .bind(run_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::NotFound(format!("running reconcile run {run_id}")));
        }

        self.get(run_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("reconcile run {run_id}")))
    }

    pub async fn get(&self, run_id: Uuid) -> Result<Option<ReconcileRun>> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, job_name, status, totals, started_at, finished_at, error_message
            FROM reconcile_runs WHERE id = ?
            "#,
        )
        .bind(run_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(ReconcileRun::try_from).transpose()
    }

    /// Newest first
    pub async fn recent(&self, limit: u32) -> Result<Vec<ReconcileRun>> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, job_name, status, totals, started_at, finished_at, error_message
            FROM reconcile_runs ORDER BY started_at DESC LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ReconcileRun::try_from).collect()
    }
}

#[derive(Debug, FromRow)]
struct RunRow {
    id: String,
    job_name: String,
    status: String,
    totals: String,
    started_at: String,
    finished_at: Option<String>,
    error_message: Option<String>,
}

impl TryFrom<RunRow> for ReconcileRun {
    type Error = SyncError;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(ReconcileRun {
            id: parse_uuid(&row.id, "run id")?,
            job_name: row.job_name,
            status: row.status.parse()?,
            totals: serde_json::from_str(&row.totals)?,
            started_at: parse_ts(&row.started_at, "started_at")?,
            finished_at: parse_opt_ts(row.finished_at, "finished_at")?,
            error_message: row.error_message,
        })
    }
}
