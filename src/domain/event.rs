//! Ledger event types
//!
//! An [`Event`] is one durably recorded change notification. It is created on
//! ingestion and afterwards only moves through the claim protocol and the
//! administrative replay / mark-done / quarantine operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{CorrelationId, EventSource, EventStatus, NormalizedEvent};
use crate::dedupe::compute_dedupe_key;
use crate::infra::Result;

/// An event about to be inserted into the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub source: EventSource,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub dedupe_key: String,
    pub correlation_id: CorrelationId,
}

impl NewEvent {
    /// Build a new event, deriving its dedupe key from the content
    pub fn new(
        source: EventSource,
        event_type: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<Self> {
        let event_type = event_type.into();
        let entity_id = entity_id.into();
        let dedupe_key = compute_dedupe_key(source, &event_type, &entity_id, &payload)?;

        Ok(Self {
            source,
            event_type,
            entity_type: entity_type.into(),
            entity_id,
            payload,
            dedupe_key,
            correlation_id: CorrelationId::new(),
        })
    }

    /// Build from a normalized inbound notification
    pub fn from_normalized(normalized: NormalizedEvent) -> Result<Self> {
        let correlation_id = normalized.correlation_id.clone();
        let event = Self::new(
            normalized.source,
            normalized.event_type,
            normalized.entity_type,
            normalized.entity_id,
            normalized.payload,
        )?;
        Ok(match correlation_id {
            Some(id) => event.with_correlation_id(id),
            None => event,
        })
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }
}

/// A recorded event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    /// Insertion order, used for oldest-first draining
    pub seq: i64,
    pub source: EventSource,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub dedupe_key: String,
    pub status: EventStatus,
    pub received_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub correlation_id: CorrelationId,
}

/// Keyset position in the errored-events scan, ordered by last attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptCursor {
    pub last_attempt_at: DateTime<Utc>,
    pub seq: i64,
}

impl AttemptCursor {
    pub fn after(event: &Event) -> Self {
        Self {
            last_attempt_at: event.processed_at.unwrap_or(event.received_at),
            seq: event.seq,
        }
    }
}

/// Result of a claim attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller now owns the event
    Claimed,
    /// Another worker owns it, or it is not pending / is quarantined
    AlreadyClaimed,
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed)
    }
}

/// One row of the append-only status history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub event_id: Uuid,
    /// `None` for the initial insert
    pub from: Option<EventStatus>,
    pub to: EventStatus,
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

/// Side annotation that excludes an event from dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub event_id: Uuid,
    pub event_source: EventSource,
    pub reason: String,
    pub quarantined_by: Option<String>,
    pub quarantined_at: DateTime<Utc>,
}

/// Result of a quarantine request
#[derive(Debug, Clone, Serialize)]
pub struct QuarantineOutcome {
    /// False when an active quarantine already existed
    pub created: bool,
    pub record: QuarantineRecord,
}

/// Filters for listing events
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventFilter {
    pub source: Option<EventSource>,
    pub status: Option<EventStatus>,
    pub entity_id: Option<String>,
    pub limit: Option<u32>,
}

impl EventFilter {
    pub const DEFAULT_LIMIT: u32 = 100;
    pub const MAX_LIMIT: u32 = 500;

    pub fn effective_limit(&self) -> u32 {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }
}
