//! SQLite event ledger
//!
//! Every status change is a single conditional UPDATE whose WHERE clause
//! names the allowed source states, so concurrent workers race on the row
//! rather than on a read-then-write. The history row is written in the same
//! transaction after the update.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqlitePool, FromRow, QueryBuilder, Sqlite, SqliteConnection};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{parse_opt_ts, parse_ts, parse_uuid, ts};
use crate::domain::{
    AttemptCursor, ClaimOutcome, CorrelationId, Event, EventFilter, EventSource, EventStatus,
    NewEvent, QuarantineOutcome, QuarantineRecord, StatusTransition,
};
use crate::infra::{retry_db, EventLedger, Result, RetryPolicy, SyncError};

const EVENT_COLUMNS: &str = "seq, id, source, event_type, entity_type, entity_id, payload, \
     dedupe_key, status, received_at, claimed_at, processed_at, error_message, correlation_id";

const NOT_QUARANTINED: &str =
    "NOT EXISTS (SELECT 1 FROM quarantined_events q WHERE q.event_id = events.id)";

/// Actor recorded for worker-driven transitions
pub const WORKER_ACTOR: &str = "worker";

/// SQLite-backed [`EventLedger`]
#[derive(Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
    /// Applied to inserts and claims, the writes that contend under load
    retry: RetryPolicy,
}

impl SqliteLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            retry: RetryPolicy::database(),
        }
    }

    /// Look up the live (non-quarantined) event holding a dedupe key
    pub async fn find_by_dedupe_key(&self, dedupe_key: &str) -> Result<Option<Event>> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE dedupe_key = ? AND {NOT_QUARANTINED} \
             ORDER BY seq ASC LIMIT 1"
        ))
        .bind(dedupe_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Event::try_from).transpose()
    }

    async fn current_status(&self, event_id: Uuid) -> Result<Option<EventStatus>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT status FROM events WHERE id = ?")
            .bind(event_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(status,)| status.parse()).transpose()
    }

    /// Explain why a conditional update matched no row
    async fn rejection(&self, event_id: Uuid, to: &str) -> SyncError {
        match self.current_status(event_id).await {
            Ok(Some(from)) => SyncError::InvalidTransition {
                event_id,
                from: from.to_string(),
                to: to.to_string(),
            },
            Ok(None) => SyncError::event_not_found(event_id),
            Err(e) => e,
        }
    }

    async fn require(&self, event_id: Uuid) -> Result<Event> {
        self.get(event_id)
            .await?
            .ok_or_else(|| SyncError::event_not_found(event_id))
    }

    async fn insert_once(&self, event: &NewEvent) -> Result<Event> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let received_at = ts(now);
        let payload_json = serde_json::to_string(&event.payload)?;

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO events (
                id, source, event_type, entity_type, entity_id,
                payload, dedupe_key, status, received_at, correlation_id
            )
            SELECT ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?
            WHERE NOT EXISTS (
                SELECT 1 FROM events e
                WHERE e.dedupe_key = ?
                  AND NOT EXISTS (SELECT 1 FROM quarantined_events q WHERE q.event_id = e.id)
            )
            "#,
        )
        .bind(id.to_string())
        .bind(event.source.as_str())
        .bind(&event.event_type)
        .bind(&event.entity_type)
        .bind(&event.entity_id)
        .bind(&payload_json)
        .bind(&event.dedupe_key)
        .bind(&received_at)
        .bind(event.correlation_id.as_str())
        .bind(&event.dedupe_key)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            let existing = self.find_by_dedupe_key(&event.dedupe_key).await?.ok_or_else(|| {
                SyncError::Internal(format!(
                    "dedupe key {} rejected but no live event holds it",
                    event.dedupe_key
                ))
            })?;
            debug!(existing_id = %existing.id, "Duplicate event");
            return Err(SyncError::DuplicateEvent(existing.id));
        }

        let seq = result.last_insert_rowid();
        record_transition(
            &mut tx,
            id,
            None,
            EventStatus::Pending,
            "ingest",
            None,
            &received_at,
        )
        .await?;
        tx.commit().await?;

        Ok(Event {
            id,
            seq,
            source: event.source,
            event_type: event.event_type.clone(),
            entity_type: event.entity_type.clone(),
            entity_id: event.entity_id.clone(),
            payload: event.payload.clone(),
            dedupe_key: event.dedupe_key.clone(),
            status: EventStatus::Pending,
            received_at: parse_ts(&received_at, "received_at")?,
            claimed_at: None,
            processed_at: None,
            error_message: None,
            correlation_id: event.correlation_id.clone(),
        })
    }

    async fn claim_once(&self, event_id: Uuid) -> Result<ClaimOutcome> {
        let now = ts(Utc::now());
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(&format!(
            "UPDATE events SET status = 'processing', claimed_at = ? \
             WHERE id = ? AND status = 'pending' AND {NOT_QUARANTINED}"
        ))
        .bind(&now)
        .bind(event_id.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            tx.rollback().await?;
            debug!("Event not claimable");
            return Ok(ClaimOutcome::AlreadyClaimed);
        }

        record_transition(
            &mut tx,
            event_id,
            Some(EventStatus::Pending),
            EventStatus::Processing,
            WORKER_ACTOR,
            None,
            &now,
        )
        .await?;
        tx.commit().await?;

        Ok(ClaimOutcome::Claimed)
    }
}

async fn record_transition(
    conn: &mut SqliteConnection,
    event_id: Uuid,
    from: Option<EventStatus>,
    to: EventStatus,
    actor: &str,
    note: Option<&str>,
    at: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO event_transitions (event_id, from_status, to_status, actor, note, at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(event_id.to_string())
    .bind(from.map(|s| s.as_str()))
    .bind(to.as_str())
    .bind(actor)
    .bind(note)
    .bind(at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[async_trait]
impl EventLedger for SqliteLedger {
    #[instrument(skip(self, event), fields(source = %event.source, entity_id = %event.entity_id))]
    async fn insert(&self, event: &NewEvent) -> Result<Event> {
        retry_db(&self.retry, "ledger.insert", || self.insert_once(event)).await
    }

    async fn get(&self, event_id: Uuid) -> Result<Option<Event>> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE id = ?"
        ))
        .bind(event_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Event::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn claim(&self, event_id: Uuid) -> Result<ClaimOutcome> {
        retry_db(&self.retry, "ledger.claim", || self.claim_once(event_id)).await
    }

    async fn complete(&self, event_id: Uuid) -> Result<()> {
        let now = ts(Utc::now());
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE events SET status = 'done', processed_at = ? WHERE id = ? AND status = 'processing'",
        )
        .bind(&now)
        .bind(event_id.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            tx.rollback().await?;
            return match self.current_status(event_id).await? {
                Some(EventStatus::Done) => Ok(()),
                _ => Err(self.rejection(event_id, EventStatus::Done.as_str()).await),
            };
        }

        record_transition(
            &mut tx,
            event_id,
            Some(EventStatus::Processing),
            EventStatus::Done,
            WORKER_ACTOR,
            None,
            &now,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn fail(&self, event_id: Uuid, message: &str) -> Result<()> {
        let now = ts(Utc::now());
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE events SET status = 'error', processed_at = ?, error_message = ?
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(&now)
        .bind(message)
        .bind(event_id.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            tx.rollback().await?;
            return Err(self.rejection(event_id, EventStatus::Error.as_str()).await);
        }

        record_transition(
            &mut tx,
            event_id,
            Some(EventStatus::Processing),
            EventStatus::Error,
            WORKER_ACTOR,
            None,
            &now,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn replay(&self, event_id: Uuid, actor: &str) -> Result<Event> {
        let now = ts(Utc::now());
        let mut tx = self.pool.begin().await?;

        // error_message is left in place for forensics
        let mut from = None;
        for candidate in [EventStatus::Error, EventStatus::Done] {
            let result = sqlx::query(&format!(
                "UPDATE events SET status = 'pending', claimed_at = NULL, processed_at = NULL \
                 WHERE id = ? AND status = ? AND {NOT_QUARANTINED}"
            ))
            .bind(event_id.to_string())
            .bind(candidate.as_str())
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 1 {
                from = Some(candidate);
                break;
            }
        }

        let Some(from) = from else {
            tx.rollback().await?;
            if self.is_quarantined(event_id).await? {
                return Err(SyncError::InvalidTransition {
                    event_id,
                    from: "quarantined".to_string(),
                    to: EventStatus::Pending.to_string(),
                });
            }
            return match self.current_status(event_id).await? {
                Some(EventStatus::Pending) => self.require(event_id).await,
                _ => Err(self.rejection(event_id, EventStatus::Pending.as_str()).await),
            };
        };

        record_transition(
            &mut tx,
            event_id,
            Some(from),
            EventStatus::Pending,
            actor,
            Some("replay"),
            &now,
        )
        .await?;
        tx.commit().await?;

        info!(actor = actor, from = %from, "Event replayed");
        self.require(event_id).await
    }

    #[instrument(skip(self))]
    async fn mark_done(&self, event_id: Uuid, actor: &str, note: Option<&str>) -> Result<Event> {
        let now = ts(Utc::now());
        let mut tx = self.pool.begin().await?;

        let mut from = None;
        for candidate in [EventStatus::Error, EventStatus::Pending] {
            let result = sqlx::query(
                "UPDATE events SET status = 'done', processed_at = ? WHERE id = ? AND status = ?",
            )
            .bind(&now)
            .bind(event_id.to_string())
            .bind(candidate.as_str())
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 1 {
                from = Some(candidate);
                break;
            }
        }

        let Some(from) = from else {
            tx.rollback().await?;
            return match self.current_status(event_id).await? {
                Some(EventStatus::Done) => self.require(event_id).await,
                _ => Err(self.rejection(event_id, EventStatus::Done.as_str()).await),
            };
        };

        record_transition(
            &mut tx,
            event_id,
            Some(from),
            EventStatus::Done,
            actor,
            Some(note.unwrap_or("mark-done")),
            &now,
        )
        .await?;
        tx.commit().await?;

        info!(actor = actor, from = %from, "Event marked done");
        self.require(event_id).await
    }

    #[instrument(skip(self))]
    async fn quarantine(
        &self,
        event_id: Uuid,
        reason: &str,
        actor: Option<&str>,
    ) -> Result<QuarantineOutcome> {
        let now = ts(Utc::now());

        let result = sqlx::query(
            r#"
            INSERT INTO quarantined_events (event_id, event_source, reason, quarantined_by, quarantined_at)
            SELECT id, source, ?, ?, ? FROM events
            WHERE id = ? AND status IN ('pending', 'error')
            ON CONFLICT(event_id) DO NOTHING
            "#,
        )
        .bind(reason)
        .bind(actor)
        .bind(&now)
        .bind(event_id.to_string())
        .execute(&self.pool)
        .await?;

        let created = result.rows_affected() == 1;
        match self.quarantine_record(event_id).await? {
            Some(record) => {
                if created {
                    info!(reason = reason, "Event quarantined");
                }
                Ok(QuarantineOutcome { created, record })
            }
            None => Err(self.rejection(event_id, "quarantined").await),
        }
    }

    async fn is_quarantined(&self, event_id: Uuid) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM quarantined_events WHERE event_id = ?")
                .bind(event_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    async fn quarantine_record(&self, event_id: Uuid) -> Result<Option<QuarantineRecord>> {
        let row = sqlx::query_as::<_, QuarantineRow>(
            r#"
            SELECT event_id, event_source, reason, quarantined_by, quarantined_at
            FROM quarantined_events WHERE event_id = ?
            "#,
        )
        .bind(event_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(QuarantineRecord::try_from).transpose()
    }

    async fn list(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {EVENT_COLUMNS} FROM events WHERE 1 = 1"));

        if let Some(source) = filter.source {
            qb.push(" AND source = ").push_bind(source.as_str());
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(entity_id) = &filter.entity_id {
            qb.push(" AND entity_id = ").push_bind(entity_id.clone());
        }
        qb.push(" ORDER BY seq DESC LIMIT ")
            .push_bind(filter.effective_limit() as i64);

        let rows = qb
            .build_query_as::<EventRow>()
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Event::try_from).collect()
    }

    async fn pending_page(&self, source: Option<EventSource>, limit: u32) -> Result<Vec<Event>> {
        self.pending_after(source, 0, limit).await
    }

    async fn pending_after(
        &self,
        source: Option<EventSource>,
        after_seq: i64,
        limit: u32,
    ) -> Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE status = 'pending' AND {NOT_QUARANTINED} AND (? IS NULL OR source = ?) \
             AND seq > ? ORDER BY seq ASC LIMIT ?"
        ))
        .bind(source.map(|s| s.as_str()))
        .bind(source.map(|s| s.as_str()))
        .bind(after_seq)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Event::try_from).collect()
    }

    async fn count_pending(&self, source: Option<EventSource>) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM events \
             WHERE status = 'pending' AND {NOT_QUARANTINED} AND (? IS NULL OR source = ?)"
        ))
        .bind(source.map(|s| s.as_str()))
        .bind(source.map(|s| s.as_str()))
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }

    async fn errored_page(
        &self,
        after: Option<&AttemptCursor>,
        limit: u32,
    ) -> Result<Vec<Event>> {
        let after_at = after.map(|c| ts(c.last_attempt_at));
        let after_seq = after.map(|c| c.seq).unwrap_or(0);

        let rows = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE status = 'error' AND {NOT_QUARANTINED} \
             AND (?1 IS NULL OR COALESCE(processed_at, received_at) > ?1 \
                  OR (COALESCE(processed_at, received_at) = ?1 AND seq > ?2)) \
             ORDER BY COALESCE(processed_at, received_at) ASC, seq ASC LIMIT ?3"
        ))
        .bind(after_at)
        .bind(after_seq)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Event::try_from).collect()
    }

    #[instrument(skip(self))]
    async fn requeue_stale(&self, older_than: Duration, actor: &str) -> Result<Vec<Uuid>> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| SyncError::Configuration(format!("stale timeout out of range: {e}")))?;
        let now = Utc::now();
        let cutoff = ts(now - age);
        let now = ts(now);

        let mut tx = self.pool.begin().await?;

        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            UPDATE events SET status = 'pending', claimed_at = NULL
            WHERE status = 'processing' AND claimed_at < ?
            RETURNING id
            "#,
        )
        .bind(&cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let mut ids = Vec::with_capacity(rows.len());
        for (raw,) in rows {
            let id = parse_uuid(&raw, "event id")?;
            record_transition(
                &mut tx,
                id,
                Some(EventStatus::Processing),
                EventStatus::Pending,
                actor,
                Some("stale claim released"),
                &now,
            )
            .await?;
            ids.push(id);
        }
        tx.commit().await?;

        if !ids.is_empty() {
            info!(count = ids.len(), "Requeued stale processing events");
        }
        Ok(ids)
    }

    async fn history(&self, event_id: Uuid) -> Result<Vec<StatusTransition>> {
        let rows = sqlx::query_as::<_, TransitionRow>(
            r#"
            SELECT event_id, from_status, to_status, actor, note, at
            FROM event_transitions WHERE event_id = ? ORDER BY id ASC
            "#,
        )
        .bind(event_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StatusTransition::try_from).collect()
    }
}

// ============================================================================
// Row types
// ============================================================================

#[derive(Debug, FromRow)]
struct EventRow {
    seq: i64,
    id: String,
    source: String,
    event_type: String,
    entity_type: String,
    entity_id: String,
    payload: String,
    dedupe_key: String,
    status: String,
    received_at: String,
    claimed_at: Option<String>,
    processed_at: Option<String>,
    error_message: Option<String>,
    correlation_id: String,
}

impl TryFrom<EventRow> for Event {
    type Error = SyncError;

    fn try_from(row: EventRow) -> Result<Self> {
        Ok(Event {
            id: parse_uuid(&row.id, "event id")?,
            seq: row.seq,
            source: row.source.parse()?,
            event_type: row.event_type,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            payload: serde_json::from_str(&row.payload)?,
            dedupe_key: row.dedupe_key,
            status: row.status.parse()?,
            received_at: parse_ts(&row.received_at, "received_at")?,
            claimed_at: parse_opt_ts(row.claimed_at, "claimed_at")?,
            processed_at: parse_opt_ts(row.processed_at, "processed_at")?,
            error_message: row.error_message,
            correlation_id: CorrelationId(row.correlation_id),
        })
    }
}

#[derive(Debug, FromRow)]
struct TransitionRow {
    event_id: String,
    from_status: Option<String>,
    to_status: String,
    actor: String,
    note: Option<String>,
    at: String,
}

impl TryFrom<TransitionRow> for StatusTransition {
    type Error = SyncError;

    fn try_from(row: TransitionRow) -> Result<Self> {
        Ok(StatusTransition {
            event_id: parse_uuid(&row.event_id, "event id")?,
            from: row.from_status.map(|s| s.parse()).transpose()?,
            to: row.to_status.parse()?,
            actor: row.actor,
            note: row.note,
            at: parse_ts(&row.at, "at")?,
        })
    }
}

#[derive(Debug, FromRow)]
struct QuarantineRow {
    event_id: String,
    event_source: String,
    reason: String,
    quarantined_by: Option<String>,
    quarantined_at: String,
}

impl TryFrom<QuarantineRow> for QuarantineRecord {
    type Error = SyncError;

    fn try_from(row: QuarantineRow) -> Result<Self> {
        Ok(QuarantineRecord {
            event_id: parse_uuid(&row.event_id, "event id")?,
            event_source: row.event_source.parse()?,
            reason: row.reason,
            quarantined_by: row.quarantined_by,
            quarantined_at: parse_ts(&row.quarantined_at, "quarantined_at")?,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::Store;
    use serde_json::json;

    async fn ledger() -> SqliteLedger {
        Store::in_memory().await.unwrap().ledger()
    }

    fn crm_event(entity_id: &str, payload: serde_json::Value) -> NewEvent {
        NewEvent::new(
            EventSource::Crm,
            "contact.updated",
            "contact",
            entity_id,
            payload,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let ledger = ledger().await;
        let event = ledger
            .insert(&crm_event("C1", json!({"phone": "+1"})))
            .await
            .unwrap();

        assert_eq!(event.status, EventStatus::Pending);
        let loaded = ledger.get(event.id).await.unwrap().unwrap();
        assert_eq!(loaded.entity_id, "C1");
        assert_eq!(loaded.payload, json!({"phone": "+1"}));
        assert_eq!(loaded.seq, event.seq);
    }

    #[tokio::test]
    async fn test_duplicate_returns_existing_id() {
        let ledger = ledger().await;
        let first = ledger
            .insert(&crm_event("C1", json!({"a": 1, "b": 2})))
            .await
            .unwrap();

        let err = ledger
            .insert(&crm_event("C1", json!({"b": 2, "a": 1})))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::DuplicateEvent(id) if id == first.id));
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let ledger = ledger().await;
        let event = ledger.insert(&crm_event("C1", json!({}))).await.unwrap();

        assert_eq!(ledger.claim(event.id).await.unwrap(), ClaimOutcome::Claimed);
        assert_eq!(
            ledger.claim(event.id).await.unwrap(),
            ClaimOutcome::AlreadyClaimed
        );
        assert_eq!(
            ledger.claim(Uuid::new_v4()).await.unwrap(),
            ClaimOutcome::AlreadyClaimed
        );
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let ledger = ledger().await;
        let event = ledger.insert(&crm_event("C1", json!({}))).await.unwrap();
        ledger.claim(event.id).await.unwrap();

        ledger.complete(event.id).await.unwrap();
        ledger.complete(event.id).await.unwrap();

        let loaded = ledger.get(event.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, EventStatus::Done);
        assert!(loaded.processed_at.is_some());
    }

    #[tokio::test]
    async fn test_complete_requires_processing() {
        let ledger = ledger().await;
        let event = ledger.insert(&crm_event("C1", json!({}))).await.unwrap();

        let err = ledger.complete(event.id).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidTransition { ref from, .. } if from == "pending"));

        let err = ledger.complete(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_replay_keeps_error_message() {
        let ledger = ledger().await;
        let event = ledger.insert(&crm_event("C1", json!({}))).await.unwrap();
        ledger.claim(event.id).await.unwrap();
        ledger.fail(event.id, "Invalid phone number").await.unwrap();

        let replayed = ledger.replay(event.id, "admin").await.unwrap();
        assert_eq!(replayed.status, EventStatus::Pending);
        assert_eq!(
            replayed.error_message.as_deref(),
            Some("Invalid phone number")
        );
        assert!(replayed.claimed_at.is_none());
    }

    #[tokio::test]
    async fn test_replay_rejects_processing() {
        let ledger = ledger().await;
        let event = ledger.insert(&crm_event("C1", json!({}))).await.unwrap();
        ledger.claim(event.id).await.unwrap();

        let err = ledger.replay(event.id, "admin").await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_replay_of_pending_is_noop() {
        let ledger = ledger().await;
        let event = ledger.insert(&crm_event("C1", json!({}))).await.unwrap();

        let replayed = ledger.replay(event.id, "admin").await.unwrap();
        assert_eq!(replayed.status, EventStatus::Pending);
        assert_eq!(ledger.history(event.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mark_done_from_error() {
        let ledger = ledger().await;
        let event = ledger.insert(&crm_event("C1", json!({}))).await.unwrap();
        ledger.claim(event.id).await.unwrap();
        ledger.fail(event.id, "boom").await.unwrap();

        let done = ledger
            .mark_done(event.id, "admin", Some("fixed by hand"))
            .await
            .unwrap();
        assert_eq!(done.status, EventStatus::Done);

        let history = ledger.history(event.id).await.unwrap();
        let last = history.last().unwrap();
        assert_eq!(last.actor, "admin");
        assert_eq!(last.note.as_deref(), Some("fixed by hand"));
    }

    #[tokio::test]
    async fn test_quarantine_blocks_claim_and_frees_key() {
        let ledger = ledger().await;
        let new_event = crm_event("C1", json!({"x": 1}));
        let event = ledger.insert(&new_event).await.unwrap();

        let outcome = ledger
            .quarantine(event.id, "poison", Some("admin"))
            .await
            .unwrap();
        assert!(outcome.created);
        let again = ledger.quarantine(event.id, "poison", None).await.unwrap();
        assert!(!again.created);

        assert_eq!(
            ledger.claim(event.id).await.unwrap(),
            ClaimOutcome::AlreadyClaimed
        );
        assert_eq!(ledger.count_pending(None).await.unwrap(), 0);

        let fresh = ledger.insert(&new_event).await.unwrap();
        assert_ne!(fresh.id, event.id);
    }

    #[tokio::test]
    async fn test_quarantine_rejects_done_events() {
        let ledger = ledger().await;
        let event = ledger.insert(&crm_event("C1", json!({}))).await.unwrap();
        ledger.claim(event.id).await.unwrap();
        ledger.complete(event.id).await.unwrap();

        let err = ledger.quarantine(event.id, "late", None).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidTransition { .. }));
        assert!(matches!(
            ledger.quarantine(Uuid::new_v4(), "x", None).await.unwrap_err(),
            SyncError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_requeue_stale() {
        let ledger = ledger().await;
        let event = ledger.insert(&crm_event("C1", json!({}))).await.unwrap();
        ledger.claim(event.id).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        assert!(ledger
            .requeue_stale(Duration::from_secs(3600), "stale-sweep")
            .await
            .unwrap()
            .is_empty());

        let ids = ledger
            .requeue_stale(Duration::ZERO, "stale-sweep")
            .await
            .unwrap();
        assert_eq!(ids, vec![event.id]);
        assert_eq!(
            ledger.get(event.id).await.unwrap().unwrap().status,
            EventStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_list_and_pending_page_ordering() {
        let ledger = ledger().await;
        let mut ids = Vec::new();
        for i in 0..3 {
            let e = ledger
                .insert(&crm_event(&format!("C{i}"), json!({"i": i})))
                .await
                .unwrap();
            ids.push(e.id);
        }

        let newest_first = ledger.list(&EventFilter::default()).await.unwrap();
        assert_eq!(newest_first[0].id, ids[2]);

        let oldest_first = ledger.pending_page(Some(EventSource::Crm), 2).await.unwrap();
        assert_eq!(oldest_first.len(), 2);
        assert_eq!(oldest_first[0].id, ids[0]);

        let next = ledger
            .pending_after(None, oldest_first[1].seq, 10)
            .await
            .unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].id, ids[2]);

        assert!(ledger
            .pending_page(Some(EventSource::Dialer), 10)
            .await
            .unwrap()
            .is_empty());

        let filtered = ledger
            .list(&EventFilter {
                entity_id: Some("C1".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
    }

    #[tokio::test]
    async fn test_history_records_each_transition() {
        let ledger = ledger().await;
        let event = ledger.insert(&crm_event("C1", json!({}))).await.unwrap();
        ledger.claim(event.id).await.unwrap();
        ledger.fail(event.id, "nope").await.unwrap();
        ledger.replay(event.id, "admin").await.unwrap();

        let history = ledger.history(event.id).await.unwrap();
        let steps: Vec<_> = history.iter().map(|t| (t.from, t.to)).collect();
        assert_eq!(
            steps,
            vec![
                (None, EventStatus::Pending),
                (Some(EventStatus::Pending), EventStatus::Processing),
                (Some(EventStatus::Processing), EventStatus::Error),
                (Some(EventStatus::Error), EventStatus::Pending),
            ]
        );
    }
}
