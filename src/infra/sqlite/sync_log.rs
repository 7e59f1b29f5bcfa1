//! Append-only propagation audit trail

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePool, FromRow};
use uuid::Uuid;

use super::{parse_ts, ts};
use crate::domain::{CorrelationId, ExternalSystem, SyncDirection, SyncLogEntry};
use crate::infra::{Result, SyncError};

const SYNC_LOG_COLUMNS: &str = "direction, entity_type, entity_id, source_id, target_id, status, \
     finished_at, error_message, correlation_id, event_id";

#[derive(Clone)]
pub struct SqliteSyncLog {
    pool: SqlitePool,
}

impl SqliteSyncLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, entry: &SyncLogEntry) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO sync_log (
                direction, entity_type, entity_id, source_id, target_id,
                status, finished_at, error_message, correlation_id, event_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.direction.map(|d| d.to_string()))
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(&entry.source_id)
        .bind(&entry.target_id)
        .bind(entry.status.as_str())
        .bind(ts(entry.finished_at))
        .bind(&entry.error_message)
        .bind(entry.correlation_id.as_str())
        .bind(entry.event_id.map(|id| id.to_string()))
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Entries written while processing one event, oldest first
    pub async fn for_event(&self, event_id: Uuid) -> Result<Vec<SyncLogEntry>> {
        let rows = sqlx::query_as::<_, SyncLogRow>(&format!(
            "SELECT {SYNC_LOG_COLUMNS} FROM sync_log WHERE event_id = ? ORDER BY id ASC"
        ))
        .bind(event_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SyncLogEntry::try_from).collect()
    }

    /// Latest successful write to `target` made under `correlation_id` at or after `since`
    pub async fn recent_write(
        &self,
        target: ExternalSystem,
        correlation_id: &CorrelationId,
        since: DateTime<Utc>,
    ) -> Result<Option<SyncLogEntry>> {
        let row = sqlx::query_as::<_, SyncLogRow>(&format!(
            "SELECT {SYNC_LOG_COLUMNS} FROM sync_log \
             WHERE correlation_id = ? AND status = 'success' AND direction LIKE ? \
             AND finished_at >= ? ORDER BY id DESC LIMIT 1"
        ))
        .bind(correlation_id.as_str())
        .bind(format!("%->{target}"))
        .bind(ts(since))
        .fetch_optional(&self.pool)
        .await?;

        row.map(SyncLogEntry::try_from).transpose()
    }

    /// Most recent entries for an entity, newest first
    pub async fn for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
        limit: u32,
    ) -> Result<Vec<SyncLogEntry>> {
        let rows = sqlx::query_as::<_, SyncLogRow>(&format!(
            "SELECT {SYNC_LOG_COLUMNS} FROM sync_log \
             WHERE entity_type = ? AND entity_id = ? ORDER BY id DESC LIMIT ?"
        ))
        .bind(entity_type)
        .bind(entity_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SyncLogEntry::try_from).collect()
    }
}

#[derive(Debug, FromRow)]
struct SyncLogRow {
    direction: Option<String>,
    entity_type: String,
    entity_id: String,
    source_id: String,
    target_id: Option<String>,
    status: String,
    finished_at: String,
    error_message: Option<String>,
    correlation_id: String,
    event_id: Option<String>,
}

impl TryFrom<SyncLogRow> for SyncLogEntry {
    type Error = SyncError;

    fn try_from(row: SyncLogRow) -> Result<Self> {
        Ok(SyncLogEntry {
            direction: row.direction.as_deref().and_then(SyncDirection::parse),
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            source_id: row.source_id,
            target_id: row.target_id,
            status: row.status.parse()?,
            finished_at: parse_ts(&row.finished_at, "finished_at")?,
            error_message: row.error_message,
            correlation_id: CorrelationId(row.correlation_id),
            event_id: row
                .event_id
                .map(|id| super::parse_uuid(&id, "event id"))
                .transpose()?,
        })
    }
}
