//! Error types for the sync middleware

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the ledger, router, scheduler and reconcilers
#[derive(Error, Debug)]
pub enum SyncError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Insert collided with an existing dedupe key. A normal dedup outcome.
    #[error("duplicate event: existing event {0}")]
    DuplicateEvent(Uuid),

    /// Another worker owns the event. Benign; the caller skips it.
    #[error("event already claimed: {0}")]
    AlreadyClaimed(Uuid),

    /// Illegal ledger transition
    #[error("invalid transition for event {event_id}: {from} -> {to}")]
    InvalidTransition {
        event_id: Uuid,
        from: String,
        to: String,
    },

    /// No handler registered for (source, event type)
    #[error("no handler registered for {source_name}/{event_type}")]
    NoHandler {
        source_name: String,
        event_type: String,
    },

    /// The external call failed; the message is kept verbatim
    #[error("{0}")]
    HandlerFailure(String),

    /// Referenced event, job or mapping does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Inbound body matched none of the known payload shapes
    #[error("unrecognized {source_name} payload: {reason}")]
    UnrecognizedPayload { source_name: String, reason: String },

    /// Caller supplied a malformed value
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// The durable store itself failed
    pub fn is_store_failure(&self) -> bool {
        matches!(self, SyncError::Database(_) | SyncError::Migration(_))
    }

    pub fn event_not_found(event_id: Uuid) -> Self {
        SyncError::NotFound(format!("event {event_id}"))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;
