//! Operator surface: list, replay, mark-done, quarantine, drain, enqueue, history
//!
//! Everything here works on single events or bounded batches and returns
//! counts or the affected event. Listings never expose raw email addresses or
//! phone numbers.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::domain::{
    Event, EventFilter, EventSource, EventStatus, Job, QuarantineOutcome, ReconcileRun,
    StatusTransition, SyncLogEntry,
};
use crate::infra::{EventLedger, Result, SqliteSyncLog, SyncError};
use crate::membership::CatalogCache;
use crate::reconcile::ReconcileRunner;
use crate::scheduler::{DrainOptions, DrainReport, EnqueueReport, Scheduler};

/// Actor used when a request names none
pub const DEFAULT_ADMIN_ACTOR: &str = "admin";

#[derive(Debug, Clone, Serialize)]
pub struct ReplayResponse {
    pub event_id: Uuid,
    pub status: EventStatus,
    pub job_id: Uuid,
}

/// An event with its full audit trail
#[derive(Debug, Clone, Serialize)]
pub struct EventDetail {
    pub event: Event,
    pub transitions: Vec<StatusTransition>,
    pub sync_log: Vec<SyncLogEntry>,
    /// Dispatch jobs for the event, oldest first
    pub jobs: Vec<Job>,
    pub quarantined: bool,
}

pub struct AdminService {
    ledger: Arc<dyn EventLedger>,
    scheduler: Arc<Scheduler>,
    sync_log: SqliteSyncLog,
    catalog: Arc<CatalogCache>,
    reconcile: Option<Arc<ReconcileRunner>>,
    drain_defaults: DrainOptions,
}

impl AdminService {
    pub fn new(
        ledger: Arc<dyn EventLedger>,
        scheduler: Arc<Scheduler>,
        sync_log: SqliteSyncLog,
        catalog: Arc<CatalogCache>,
    ) -> Self {
        let drain_defaults = scheduler.config().drain.clone();
        Self {
            ledger,
            scheduler,
            sync_log,
            catalog,
            reconcile: None,
            drain_defaults,
        }
    }

    pub fn with_reconcile(mut self, runner: Arc<ReconcileRunner>) -> Self {
        self.reconcile = Some(runner);
        self
    }

    pub fn drain_defaults(&self) -> &DrainOptions {
        &self.drain_defaults
    }

    /// Filtered listing, newest first, with PII masked in payloads
    pub async fn list_events(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let events = self.ledger.list(filter).await?;
        Ok(events
            .into_iter()
            .map(|mut event| {
                event.payload = redact_pii(&event.payload);
                event
            })
            .collect())
    }

    #[instrument(skip(self))]
    pub async fn event_detail(&self, event_id: Uuid) -> Result<EventDetail> {
        let mut event = self
            .ledger
            .get(event_id)
            .await?
            .ok_or_else(|| SyncError::event_not_found(event_id))?;
        event.payload = redact_pii(&event.payload);

        Ok(EventDetail {
            transitions: self.ledger.history(event_id).await?,
            sync_log: self.sync_log.for_event(event_id).await?,
            jobs: self.scheduler.jobs().jobs_for_event(event_id).await?,
            quarantined: self.ledger.is_quarantined(event_id).await?,
            event,
        })
    }

    #[instrument(skip(self))]
    pub async fn replay(&self, event_id: Uuid, actor: Option<&str>) -> Result<ReplayResponse> {
        let actor = actor.unwrap_or(DEFAULT_ADMIN_ACTOR);
        let (event, job) = self.scheduler.replay(event_id, actor).await?;
        Ok(ReplayResponse {
            event_id: event.id,
            status: event.status,
            job_id: job.id,
        })
    }

    #[instrument(skip(self))]
    pub async fn mark_done(
        &self,
        event_id: Uuid,
        actor: Option<&str>,
        note: Option<&str>,
    ) -> Result<Event> {
        let mut event = self
            .ledger
            .mark_done(event_id, actor.unwrap_or(DEFAULT_ADMIN_ACTOR), note)
            .await?;
        event.payload = redact_pii(&event.payload);
        Ok(event)
    }

    #[instrument(skip(self))]
    pub async fn quarantine(
        &self,
        event_id: Uuid,
        reason: &str,
        actor: Option<&str>,
    ) -> Result<QuarantineOutcome> {
        if reason.trim().is_empty() {
            return Err(SyncError::InvalidInput(
                "quarantine reason must not be empty".to_string(),
            ));
        }
        let outcome = self.ledger.quarantine(event_id, reason, actor).await?;
        info!(created = outcome.created, "Event quarantined");
        Ok(outcome)
    }

    pub async fn drain(&self, options: &DrainOptions) -> Result<DrainReport> {
        self.scheduler.drain(options).await
    }

    pub async fn enqueue_pending(&self, source: Option<EventSource>) -> Result<EnqueueReport> {
        self.scheduler.enqueue_pending(source).await
    }

    pub async fn run_reconcile(&self, job_name: &str) -> Result<ReconcileRun> {
        self.runner()?.run(job_name).await
    }

    pub async fn recent_reconcile_runs(&self, limit: u32) -> Result<Vec<ReconcileRun>> {
        self.runner()?.runs().recent(limit).await
    }

    /// Re-read the list catalog from its source
    pub async fn reload_catalog(&self) -> Result<usize> {
        Ok(self.catalog.reload().await?.rules.len())
    }

    fn runner(&self) -> Result<&Arc<ReconcileRunner>> {
        self.reconcile
            .as_ref()
            .ok_or_else(|| SyncError::Configuration("reconciliation is not configured".into()))
    }
}

// ============================================================================
// PII redaction
// ============================================================================

/// Keys whose values are contact details. Message endpoints are phone numbers.
fn is_pii_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.contains("email") || key.contains("phone") || key == "from" || key == "to"
}

/// An E.164 number: `+` followed by 8 to 15 digits
fn is_e164(s: &str) -> bool {
    s.strip_prefix('+').is_some_and(|digits| {
        (8..=15).contains(&digits.len()) && digits.bytes().all(|b| b.is_ascii_digit())
    })
}

/// Mask email and phone values anywhere in a JSON document
pub fn redact_pii(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let v = if is_pii_key(k) { mask(v) } else { redact_pii(v) };
                    (k.clone(), v)
                })
                .collect(),
        ),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(redact_pii).collect())
        }
        serde_json::Value::String(s) if is_e164(s) => serde_json::Value::String(mask_str(s)),
        other => other.clone(),
    }
}

fn mask(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(mask_str(s)),
        serde_json::Value::Array(items) => serde_json::Value::Array(items.iter().map(mask).collect()),
        serde_json::Value::Object(_) => redact_pii(value),
        serde_json::Value::Null => serde_json::Value::Null,
        _ => serde_json::Value::String("***".to_string()),
    }
}

/// `jane@example.com` -> `j***@example.com`, `+1 555 123 4567` -> `***4567`
pub fn mask_str(raw: &str) -> String {
    if let Some((local, domain)) = raw.split_once('@') {
        let first: String = local.chars().take(1).collect();
        return format!("{first}***@{domain}");
    }

    let digits: Vec<char> = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() >= 4 {
        let tail: String = digits[digits.len() - 4..].iter().collect();
        format!("***{tail}")
    } else {
        "***".to_string()
    }
}
