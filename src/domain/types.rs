//! Core type definitions for the sync middleware
//!
//! Closed sets (event sources, ledger statuses, external systems) and the
//! identifier newtypes that flow through every downstream effect.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::infra::SyncError;

/// Platform an inbound notification came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Crm,
    Dialer,
    Messaging,
    Broadcast,
}

impl EventSource {
    pub const ALL: [EventSource; 4] = [
        EventSource::Crm,
        EventSource::Dialer,
        EventSource::Messaging,
        EventSource::Broadcast,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Crm => "crm",
            EventSource::Dialer => "dialer",
            EventSource::Messaging => "messaging",
            EventSource::Broadcast => "broadcast",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventSource {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "crm" => Ok(EventSource::Crm),
            "dialer" => Ok(EventSource::Dialer),
            "messaging" => Ok(EventSource::Messaging),
            "broadcast" => Ok(EventSource::Broadcast),
            other => Err(SyncError::InvalidInput(format!("unknown event source: {other}"))),
        }
    }
}

/// Ledger status of an event.
///
/// Quarantine is not a status; it is an overlay recorded next to the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Processing,
    Done,
    Error,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Done => "done",
            EventStatus::Error => "error",
        }
    }

    /// Terminal statuses are the only ones a replay may start from
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Done | EventStatus::Error)
    }

    /// Whether `self -> to` is a legal ledger transition for the given actor kind.
    ///
    /// Worker transitions: pending -> processing -> {done, error}.
    /// Administrative transitions: {done, error} -> pending (replay),
    /// {pending, error} -> done (mark done).
    pub fn can_transition(&self, to: EventStatus, administrative: bool) -> bool {
        use EventStatus::*;
        match (self, to) {
            (Pending, Processing) | (Processing, Done) | (Processing, Error) => true,
            (Done, Pending) | (Error, Pending) => administrative,
            (Pending, Done) | (Error, Done) => administrative,
            _ => false,
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "processing" => Ok(EventStatus::Processing),
            "done" => Ok(EventStatus::Done),
            "error" => Ok(EventStatus::Error),
            other => Err(SyncError::InvalidInput(format!("unknown event status: {other}"))),
        }
    }
}

/// External platform a sync handler reads from or writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalSystem {
    Crm,
    Dialer,
    Messaging,
}

impl ExternalSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalSystem::Crm => "crm",
            ExternalSystem::Dialer => "dialer",
            ExternalSystem::Messaging => "messaging",
        }
    }

    /// The system whose notifications are reported under `source`, if any
    pub fn for_source(source: EventSource) -> Option<Self> {
        match source {
            EventSource::Crm => Some(ExternalSystem::Crm),
            EventSource::Dialer => Some(ExternalSystem::Dialer),
            EventSource::Messaging => Some(ExternalSystem::Messaging),
            EventSource::Broadcast => None,
        }
    }
}

impl fmt::Display for ExternalSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered pair of systems a propagation attempt moved data between
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncDirection {
    pub from: ExternalSystem,
    pub to: ExternalSystem,
}

impl SyncDirection {
    pub fn new(from: ExternalSystem, to: ExternalSystem) -> Self {
        Self { from, to }
    }

    /// Parse the `crm->dialer` form stored in the sync log
    pub fn parse(s: &str) -> Option<Self> {
        let (from, to) = s.split_once("->")?;
        let parse = |v: &str| match v {
            "crm" => Some(ExternalSystem::Crm),
            "dialer" => Some(ExternalSystem::Dialer),
            "messaging" => Some(ExternalSystem::Messaging),
            _ => None,
        };
        Some(Self::new(parse(from)?, parse(to)?))
    }
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.from, self.to)
    }
}

/// Correlation identifier propagated through every downstream effect
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
