//! Audit trail of propagation attempts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{CorrelationId, SyncDirection};
use crate::infra::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncLogStatus {
    Success,
    Error,
    Skipped,
}

impl SyncLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncLogStatus::Success => "success",
            SyncLogStatus::Error => "error",
            SyncLogStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for SyncLogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncLogStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(SyncLogStatus::Success),
            "error" => Ok(SyncLogStatus::Error),
            "skipped" => Ok(SyncLogStatus::Skipped),
            other => Err(SyncError::InvalidInput(format!("unknown sync status: {other}"))),
        }
    }
}

/// One propagation attempt. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLogEntry {
    /// `None` when the direction is not known (no handler, loop suppressed)
    pub direction: Option<SyncDirection>,
    pub entity_type: String,
    pub entity_id: String,
    pub source_id: String,
    pub target_id: Option<String>,
    pub status: SyncLogStatus,
    pub finished_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub correlation_id: CorrelationId,
    /// Ledger event that triggered the attempt
    pub event_id: Option<Uuid>,
}

impl SyncLogEntry {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        status: SyncLogStatus,
        correlation_id: CorrelationId,
    ) -> Self {
        let entity_id = entity_id.into();
        Self {
            direction: None,
            entity_type: entity_type.into(),
            source_id: entity_id.clone(),
            entity_id,
            target_id: None,
            status,
            finished_at: Utc::now(),
            error_message: None,
            correlation_id,
            event_id: None,
        }
    }

    pub fn with_direction(mut self, direction: SyncDirection) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn with_target(mut self, target_id: Option<String>) -> Self {
        self.target_id = target_id;
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_event(mut self, event_id: Uuid) -> Self {
        self.event_id = Some(event_id);
        self
    }
}
