//! Trait definitions for the ledger and job queue

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    AttemptCursor, ClaimOutcome, Event, EventFilter, EventSource, Job, JobPayload, NewEvent,
    QuarantineOutcome, QuarantineRecord, StatusTransition,
};

use super::Result;

/// Durable record of every inbound event and its processing status.
///
/// Invariant: at most one non-quarantined event per dedupe key, and an event
/// leaves `pending` only through [`EventLedger::claim`] or an administrative
/// operation.
#[async_trait]
pub trait EventLedger: Send + Sync {
    /// Record a new event as `pending`.
    ///
    /// Fails with `DuplicateEvent(existing_id)` when a non-quarantined event
    /// with the same dedupe key already exists. The check and the insert are
    /// one atomic statement.
    async fn insert(&self, event: &NewEvent) -> Result<Event>;

    async fn get(&self, event_id: Uuid) -> Result<Option<Event>>;

    /// Conditionally move `pending -> processing`.
    ///
    /// Exactly one concurrent caller gets `Claimed`. Missing, non-pending and
    /// quarantined events all yield `AlreadyClaimed`.
    async fn claim(&self, event_id: Uuid) -> Result<ClaimOutcome>;

    /// `processing -> done`. Idempotent on an event that is already done.
    async fn complete(&self, event_id: Uuid) -> Result<()>;

    /// `processing -> error`, storing the message verbatim
    async fn fail(&self, event_id: Uuid, message: &str) -> Result<()>;

    /// `done | error -> pending` so the event can be dispatched again.
    ///
    /// The previous error message is kept for forensics.
    async fn replay(&self, event_id: Uuid, actor: &str) -> Result<Event>;

    /// `pending | error -> done` without dispatch
    async fn mark_done(&self, event_id: Uuid, actor: &str, note: Option<&str>) -> Result<Event>;

    /// Exclude an event from dispatch. Only `pending` or `error` events qualify.
    async fn quarantine(
        &self,
        event_id: Uuid,
        reason: &str,
        actor: Option<&str>,
    ) -> Result<QuarantineOutcome>;

    async fn is_quarantined(&self, event_id: Uuid) -> Result<bool>;

    async fn quarantine_record(&self, event_id: Uuid) -> Result<Option<QuarantineRecord>>;

    /// Newest first, bounded by the filter's limit
    async fn list(&self, filter: &EventFilter) -> Result<Vec<Event>>;

    /// Oldest-first pending events, quarantined ones excluded
    async fn pending_page(&self, source: Option<EventSource>, limit: u32) -> Result<Vec<Event>>;

    /// Pending events with `seq > after_seq`, oldest first, for cursor paging
    async fn pending_after(
        &self,
        source: Option<EventSource>,
        after_seq: i64,
        limit: u32,
    ) -> Result<Vec<Event>>;

    async fn count_pending(&self, source: Option<EventSource>) -> Result<u64>;

    /// Errored events least recently attempted first, quarantined ones excluded.
    /// Pass the cursor of the last event seen to continue a scan.
    async fn errored_page(
        &self,
        after: Option<&AttemptCursor>,
        limit: u32,
    ) -> Result<Vec<Event>>;

    /// Return events stuck in `processing` longer than `older_than` to `pending`
    async fn requeue_stale(&self, older_than: Duration, actor: &str) -> Result<Vec<Uuid>>;

    /// Status history, oldest first
    async fn history(&self, event_id: Uuid) -> Result<Vec<StatusTransition>>;
}

/// Durable queue of dispatch jobs.
///
/// Jobs only reference events; the ledger stays the source of truth.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Queue a job. Returns the existing queued job for the event if there is one.
    async fn enqueue(
        &self,
        queue: &str,
        payload: &JobPayload,
        max_attempts: u32,
        run_at: DateTime<Utc>,
    ) -> Result<Job>;

    /// Atomically take the next due job, moving it to `running` and counting an attempt
    async fn fetch_next(&self, queue: &str) -> Result<Option<Job>>;

    async fn mark_done(&self, job_id: Uuid) -> Result<()>;

    /// Put a running job back in the queue after a failed attempt
    async fn retry_later(&self, job_id: Uuid, error: &str, run_at: DateTime<Utc>) -> Result<()>;

    /// Put a running job back without counting the attempt
    async fn defer(&self, job_id: Uuid, run_at: DateTime<Utc>) -> Result<()>;

    async fn mark_failed(&self, job_id: Uuid, error: &str) -> Result<()>;

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    async fn jobs_for_event(&self, event_id: Uuid) -> Result<Vec<Job>>;

    /// Whether a queued or running job exists for the event
    async fn has_live_job(&self, event_id: Uuid) -> Result<bool>;

    /// Requeue jobs left `running` by a crashed worker
    async fn requeue_stale(&self, older_than: Duration) -> Result<u64>;
}
