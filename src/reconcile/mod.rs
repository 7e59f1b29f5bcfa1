//! Drift reconciliation
//!
//! A run does three passes and records its counters in `reconcile_runs`:
//!
//! 1. stale `processing` events are returned to `pending` and requeued
//! 2. errored events with no live job are replayed and routed again
//! 3. every known contact is fetched from the CRM and its list memberships
//!    are brought in line with its current attributes
//!
//! Failures of a single event or contact are counted and the run goes on.
//! Only a failing store marks the run `error`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::collaborators::ExternalSystems;
use crate::domain::{
    AttemptCursor, ContactAttributes, CorrelationId, ExternalSystem, ReconcileRun, ReconcileRunStatus,
    ReconcileTotals,
};
use crate::infra::{Result, SqliteReconcileRunStore};
use crate::ingest::UNRECOGNIZED_EVENT_TYPE;
use crate::membership::{ContactReconcileOutcome, MembershipReconciler};
use crate::router::RouteResult;
use crate::scheduler::Scheduler;

/// Actor recorded on replays made by a reconcile run
pub const RECONCILE_ACTOR: &str = "reconcile";

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Errored events re-driven per run
    pub redrive_limit: u32,
    /// Period of the background run; zero disables it
    pub interval: Duration,
    /// Contacts read per page
    pub contact_page_size: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            redrive_limit: 100,
            interval: Duration::from_secs(3600),
            contact_page_size: 200,
        }
    }
}

impl ReconcileConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let redrive_limit = std::env::var("RECONCILE_REDRIVE_LIMIT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.redrive_limit);

        let interval = std::env::var("RECONCILE_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.interval);

        Self {
            redrive_limit,
            interval,
            ..defaults
        }
    }
}

pub struct ReconcileRunner {
    scheduler: Arc<Scheduler>,
    reconciler: Arc<MembershipReconciler>,
    systems: Arc<dyn ExternalSystems>,
    runs: SqliteReconcileRunStore,
    config: ReconcileConfig,
}

impl ReconcileRunner {
    pub fn new(
        scheduler: Arc<Scheduler>,
        reconciler: Arc<MembershipReconciler>,
        systems: Arc<dyn ExternalSystems>,
        runs: SqliteReconcileRunStore,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            scheduler,
            reconciler,
            systems,
            runs,
            config,
        }
    }

    pub fn runs(&self) -> &SqliteReconcileRunStore {
        &self.runs
    }

    /// Run one sweep and record it
    #[instrument(skip(self))]
    pub async fn run(&self, job_name: &str) -> Result<ReconcileRun> {
        let run = self.runs.start(job_name).await?;
        let mut totals = ReconcileTotals::default();

        let outcome = self.sweep(&mut totals).await;
        let (status, message) = match &outcome {
            Ok(()) => (ReconcileRunStatus::Success, None),
            Err(e) => {
                error!(run_id = %run.id, error = %e, "Reconcile run failed");
                (ReconcileRunStatus::Error, Some(e.to_string()))
            }
        };

        let finished = self
            .runs
            .finish(run.id, status, &totals, message.as_deref())
            .await?;
        info!(
            run_id = %finished.id,
            status = %finished.status,
            stale_requeued = totals.stale_requeued,
            errors_redriven = totals.errors_redriven,
            contacts_checked = totals.contacts_checked,
            contacts_failed = totals.contacts_failed,
            "Reconcile run finished"
        );
        Ok(finished)
    }

    async fn sweep(&self, totals: &mut ReconcileTotals) -> Result<()> {
        totals.stale_requeued = self.scheduler.sweep_stale().await?;
        self.redrive_errors(totals).await?;
        self.reconcile_contacts(totals).await
    }

    async fn redrive_errors(&self, totals: &mut ReconcileTotals) -> Result<()> {
        let router = self.scheduler.router();
        let ledger = router.ledger();
        let mut budget = self.config.redrive_limit;
        let mut cursor: Option<AttemptCursor> = None;
        let mut seen = HashSet::new();

        // Least recently attempted first, so events that fail again move to the back.
        while budget > 0 {
            let page = ledger
                .errored_page(cursor.as_ref(), self.config.redrive_limit)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(AttemptCursor::after(last));

            for event in &page {
                if budget == 0 {
                    break;
                }
                // A re-drive that failed again sorts behind the cursor.
                if !seen.insert(event.id) {
                    continue;
                }
                // Neither an unknown body nor a missing route gets better by retrying.
                if event.event_type == UNRECOGNIZED_EVENT_TYPE
                    || router.handler_for(event.source, &event.event_type).is_none()
                {
                    totals.redrive_skipped += 1;
                    continue;
                }
                if self.scheduler.jobs().has_live_job(event.id).await? {
                    continue;
                }

                budget -= 1;
                let attempt = async {
                    ledger.replay(event.id, RECONCILE_ACTOR).await?;
                    router.dispatch(event.id).await
                };
                match attempt.await {
                    Ok(RouteResult::NotClaimed) => {}
                    Ok(route) if route.failure_message().is_some() => totals.redrive_failed += 1,
                    Ok(_) => totals.errors_redriven += 1,
                    Err(e) if e.is_store_failure() => return Err(e),
                    Err(e) => {
                        warn!(event_id = %event.id, error = %e, "Re-drive failed");
                        totals.redrive_failed += 1;
                    }
                }
            }
        }
        Ok(())
    }

    async fn reconcile_contacts(&self, totals: &mut ReconcileTotals) -> Result<()> {
        let store = self.reconciler.store();
        let mut cursor: Option<String> = None;

        loop {
            let page = store
                .known_contacts(cursor.as_deref(), self.config.contact_page_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(last.clone());

            for contact_id in &page {
                totals.contacts_checked += 1;
                match self.reconcile_contact(contact_id).await {
                    Ok(outcome) => {
                        totals.memberships_activated += u64::from(outcome.delta.activated);
                        totals.memberships_removed += u64::from(outcome.delta.removed);
                        if outcome.reassigned {
                            totals.reassignments += 1;
                        }
                    }
                    Err(e) if e.is_store_failure() => return Err(e),
                    Err(e) => {
                        warn!(contact_id = %contact_id, error = %e, "Contact reconcile failed");
                        totals.contacts_failed += 1;
                    }
                }
            }
        }
        Ok(())
    }

    async fn reconcile_contact(&self, contact_id: &str) -> Result<ContactReconcileOutcome> {
        // A contact the CRM no longer has is treated as unassigned.
        let attrs = match self.systems.fetch_entity(ExternalSystem::Crm, contact_id).await? {
            Some(entity) => ContactAttributes::from_crm_record(contact_id, &entity.fields),
            None => ContactAttributes {
                contact_id: contact_id.to_string(),
                ..Default::default()
            },
        };
        self.reconciler
            .reconcile_contact(&attrs, &CorrelationId::new())
            .await
    }

    /// Run every `interval` until shutdown. Returns `None` when disabled.
    pub fn spawn_periodic(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        if self.config.interval.is_zero() {
            return None;
        }
        let period = self.config.interval;

        Some(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.run("periodic").await {
                            error!(error = %e, "Periodic reconcile could not be recorded");
                        }
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemorySystems;
    use crate::domain::{EventSource, EventStatus, MembershipChange, NewEvent};
    use crate::infra::{EventLedger, RetryPolicy, Store};
    use crate::membership::{CatalogCache, ListCatalog};
    use crate::router::{HandlerOutcome, MockSyncHandler, Router};
    use crate::scheduler::SchedulerConfig;
    use serde_json::json;

    struct Fixture {
        store: Store,
        systems: Arc<InMemorySystems>,
        reconciler: Arc<MembershipReconciler>,
        runner: ReconcileRunner,
    }

    fn fixture_with(store: Store, handler: MockSyncHandler) -> Fixture {
        let systems = Arc::new(InMemorySystems::new(store.mappings()));
        let reconciler = Arc::new(MembershipReconciler::new(
            store.memberships(),
            Arc::new(CatalogCache::with_catalog(ListCatalog::standard())),
        ));
        let mut router = Router::new(
            Arc::new(store.ledger()),
            store.sync_log(),
            reconciler.clone(),
        );
        router.register(EventSource::Crm, "contact.*", Arc::new(handler));
        let scheduler = Arc::new(Scheduler::new(
            Arc::new(router),
            Arc::new(store.jobs()),
            SchedulerConfig {
                retry: RetryPolicy::immediate(1),
                ..Default::default()
            },
        ));
        let runner = ReconcileRunner::new(
            scheduler,
            reconciler.clone(),
            systems.clone(),
            store.reconcile_runs(),
            ReconcileConfig::default(),
        );
        Fixture {
            store,
            systems,
            reconciler,
            runner,
        }
    }

    #[tokio::test]
    async fn test_redrives_errored_events() {
        let store = Store::in_memory().await.unwrap();
        let mut handler = MockSyncHandler::new();
        handler.expect_name().return_const("contact-sync");
        handler.expect_handle().returning(|_| {
            Ok(HandlerOutcome::Skipped {
                reason: "noop".into(),
            })
        });
        let f = fixture_with(store, handler);

        let ledger = f.store.ledger();
        let event = ledger
            .insert(
                &NewEvent::new(EventSource::Crm, "contact.updated", "contact", "C1", json!({"a": 1}))
                    .unwrap(),
            )
            .await
            .unwrap();
        ledger.claim(event.id).await.unwrap();
        ledger.fail(event.id, "timeout: handler contact-sync exceeded 30000ms").await.unwrap();

        let run = f.runner.run("manual").await.unwrap();
        assert_eq!(run.status, ReconcileRunStatus::Success);
        assert_eq!(run.totals.errors_redriven, 1);

        let stored = ledger.get(event.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Done);
    }

    #[tokio::test]
    async fn test_repairs_membership_drift() {
        let store = Store::in_memory().await.unwrap();
        let mut handler = MockSyncHandler::new();
        handler.expect_name().return_const("contact-sync");
        let f = fixture_with(store, handler);

        // Memberships recorded under alice, but the CRM now says bob.
        f.reconciler
            .apply_membership_change(
                &MembershipChange::new("C1", "alice", CorrelationId::new()).add(["hot-leads"]),
            )
            .await
            .unwrap();
        f.reconciler.store().set_last_agent("C1", "alice").await.unwrap();
        f.systems
            .put(
                ExternalSystem::Crm,
                "C1",
                json!({"assignedTo": "bob", "tags": ["hot"]}),
            )
            .await;

        let run = f.runner.run("manual").await.unwrap();
        assert_eq!(run.totals.contacts_checked, 1);
        assert_eq!(run.totals.reassignments, 1);
        assert!(f.reconciler.store().active_lists("C1", "alice").await.unwrap().is_empty());
        assert!(f
            .reconciler
            .store()
            .active_lists("C1", "bob")
            .await
            .unwrap()
            .contains("hot-leads"));
    }

    #[tokio::test]
    async fn test_contact_failure_is_counted() {
        let store = Store::in_memory().await.unwrap();
        let mut handler = MockSyncHandler::new();
        handler.expect_name().return_const("contact-sync");
        let f = fixture_with(store, handler);

        f.reconciler.store().set_last_agent("C1", "alice").await.unwrap();
        f.reconciler.store().set_last_agent("C2", "alice").await.unwrap();
        f.systems.fail_next(ExternalSystem::Crm, "503 upstream", 1).await;

        let run = f.runner.run("manual").await.unwrap();
        assert_eq!(run.status, ReconcileRunStatus::Success);
        assert_eq!(run.totals.contacts_checked, 2);
        assert_eq!(run.totals.contacts_failed, 1);
        assert_eq!(f.runner.runs().recent(5).await.unwrap().len(), 1);
    }
}
