//! Reconciliation sweep records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::infra::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileRunStatus {
    Running,
    Success,
    Error,
}

impl ReconcileRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileRunStatus::Running => "running",
            ReconcileRunStatus::Success => "success",
            ReconcileRunStatus::Error => "error",
        }
    }
}

impl fmt::Display for ReconcileRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReconcileRunStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ReconcileRunStatus::Running),
            "success" => Ok(ReconcileRunStatus::Success),
            "error" => Ok(ReconcileRunStatus::Error),
            other => Err(SyncError::InvalidInput(format!("unknown run status: {other}"))),
        }
    }
}

/// Counters accumulated by one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileTotals {
    pub stale_requeued: u64,
    pub errors_redriven: u64,
    pub redrive_failed: u64,
    /// Errored events left alone because no handler could take them
    pub redrive_skipped: u64,
    pub contacts_checked: u64,
    pub contacts_failed: u64,
    pub memberships_activated: u64,
    pub memberships_removed: u64,
    pub reassignments: u64,
}

/// One row per sweep invocation. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileRun {
    pub id: Uuid,
    pub job_name: String,
    pub status: ReconcileRunStatus,
    pub totals: ReconcileTotals,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}
