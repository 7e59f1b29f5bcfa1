//! Event ingestion
//!
//! normalize -> dedupe key -> ledger insert -> dispatch job

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::dedupe::payload_fingerprint;
use crate::domain::{normalize, CorrelationId, EventSource, NewEvent};
use crate::infra::{EventLedger, Result, SyncError};
use crate::scheduler::Scheduler;

/// Event type recorded for bodies matching no known shape
pub const UNRECOGNIZED_EVENT_TYPE: &str = "unrecognized";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    Accepted { event_id: Uuid, job_id: Uuid },
    /// Same content already recorded; nothing new was queued
    Duplicate { existing_id: Uuid },
}

impl IngestOutcome {
    pub fn event_id(&self) -> Uuid {
        match self {
            IngestOutcome::Accepted { event_id, .. } => *event_id,
            IngestOutcome::Duplicate { existing_id } => *existing_id,
        }
    }
}

pub struct IngestService {
    ledger: Arc<dyn EventLedger>,
    scheduler: Arc<Scheduler>,
}

impl IngestService {
    pub fn new(ledger: Arc<dyn EventLedger>, scheduler: Arc<Scheduler>) -> Self {
        Self { ledger, scheduler }
    }

    /// Record an inbound notification and queue it for dispatch.
    ///
    /// An unrecognized body is still recorded, as an `error` event carrying
    /// the rejection message, and the rejection is returned.
    #[instrument(skip(self, raw))]
    pub async fn ingest(
        &self,
        source: EventSource,
        raw: serde_json::Value,
        correlation_id: Option<CorrelationId>,
    ) -> Result<IngestOutcome> {
        let normalized = match normalize(source, raw.clone()) {
            Ok(normalized) => normalized,
            Err(e @ SyncError::UnrecognizedPayload { .. }) => {
                self.record_unrecognized(source, raw, correlation_id, &e)
                    .await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let mut event = NewEvent::from_normalized(normalized)?;
        if let Some(id) = correlation_id {
            event = event.with_correlation_id(id);
        }

        let stored = match self.ledger.insert(&event).await {
            Ok(stored) => stored,
            Err(SyncError::DuplicateEvent(existing_id)) => {
                info!(%existing_id, "Duplicate delivery dropped");
                return Ok(IngestOutcome::Duplicate { existing_id });
            }
            Err(e) => return Err(e),
        };

        let job = self.scheduler.enqueue_event(&stored).await?;
        info!(
            event_id = %stored.id,
            event_type = %stored.event_type,
            entity_id = %stored.entity_id,
            correlation_id = %stored.correlation_id,
            "Event accepted"
        );

        Ok(IngestOutcome::Accepted {
            event_id: stored.id,
            job_id: job.id,
        })
    }

    async fn record_unrecognized(
        &self,
        source: EventSource,
        raw: serde_json::Value,
        correlation_id: Option<CorrelationId>,
        rejection: &SyncError,
    ) -> Result<()> {
        let fingerprint = payload_fingerprint(&raw)?;
        let mut event = NewEvent::new(
            source,
            UNRECOGNIZED_EVENT_TYPE,
            "unknown",
            fingerprint,
            raw,
        )?;
        if let Some(id) = correlation_id {
            event = event.with_correlation_id(id);
        }

        let stored = match self.ledger.insert(&event).await {
            Ok(stored) => stored,
            // Same bad body again; the first copy is already visible.
            Err(SyncError::DuplicateEvent(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        if self.ledger.claim(stored.id).await?.is_claimed() {
            self.ledger.fail(stored.id, &rejection.to_string()).await?;
        }
        warn!(event_id = %stored.id, error = %rejection, "Unrecognized payload recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventFilter, EventStatus};
    use crate::infra::{SqliteLedger, Store};
    use crate::membership::{CatalogCache, ListCatalog, MembershipReconciler};
    use crate::router::Router;
    use crate::scheduler::SchedulerConfig;
    use serde_json::json;

    async fn service() -> (IngestService, Arc<SqliteLedger>, Store) {
        let store = Store::in_memory().await.unwrap();
        let ledger = Arc::new(store.ledger());
        let reconciler = Arc::new(MembershipReconciler::new(
            store.memberships(),
            Arc::new(CatalogCache::with_catalog(ListCatalog::standard())),
        ));
        let router = Arc::new(Router::new(ledger.clone(), store.sync_log(), reconciler));
        let scheduler = Arc::new(Scheduler::new(
            router,
            Arc::new(store.jobs()),
            SchedulerConfig::default(),
        ));
        (IngestService::new(ledger.clone(), scheduler), ledger, store)
    }

    #[tokio::test]
    async fn test_accepts_and_queues() {
        let (service, ledger, store) = service().await;
        let outcome = service
            .ingest(
                EventSource::Crm,
                json!({"type": "ContactUpdate", "contactId": "C1", "phone": "+15550001"}),
                None,
            )
            .await
            .unwrap();

        let IngestOutcome::Accepted { event_id, job_id } = outcome else {
            panic!("expected acceptance");
        };
        let event = ledger.get(event_id).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.entity_id, "C1");

        let job = crate::infra::JobQueue::get(&store.jobs(), job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.event_id, event_id);
    }

    #[tokio::test]
    async fn test_identical_delivery_is_duplicate() {
        let (service, ledger, _store) = service().await;
        let body = json!({"event": "contact.updated", "contact": {"id": "C1", "phone": "+1"}});

        let first = service
            .ingest(EventSource::Crm, body.clone(), None)
            .await
            .unwrap();
        let second = service.ingest(EventSource::Crm, body, None).await.unwrap();

        assert_eq!(
            second,
            IngestOutcome::Duplicate {
                existing_id: first.event_id()
            }
        );
        assert_eq!(ledger.list(&EventFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_explicit_correlation_id_wins() {
        let (service, ledger, _store) = service().await;
        let outcome = service
            .ingest(
                EventSource::Dialer,
                json!({"event_type": "disposition.set", "contact_id": "D1"}),
                Some(CorrelationId::from("corr-9")),
            )
            .await
            .unwrap();
        let event = ledger.get(outcome.event_id()).await.unwrap().unwrap();
        assert_eq!(event.correlation_id.as_str(), "corr-9");
    }

    #[tokio::test]
    async fn test_unrecognized_payload_is_recorded_as_error() {
        let (service, ledger, _store) = service().await;
        let err = service
            .ingest(EventSource::Dialer, json!({"weird": true}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnrecognizedPayload { .. }));

        let events = ledger.list(&EventFilter::default()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, EventStatus::Error);
        assert_eq!(events[0].event_type, UNRECOGNIZED_EVENT_TYPE);
        assert_eq!(events[0].error_message.as_deref(), Some(err.to_string().as_str()));
    }
}
