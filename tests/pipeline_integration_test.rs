//! End-to-end pipeline tests: ingest -> job -> claim -> route -> handler.

mod common;

use std::time::Duration;

use serde_json::json;

use df_middleware::domain::{EventSource, EventStatus, ExternalSystem, SyncLogStatus};
use df_middleware::infra::EventLedger;
use df_middleware::ingest::IngestOutcome;
use df_middleware::origin::{EXTERNAL_ID_PREFIX, ORIGIN_MARKER};
use df_middleware::router::RouteResult;
use df_middleware::scheduler::{DrainOptions, JobOutcome};

use common::*;

async fn accepted(h: &Harness, source: EventSource, payload: serde_json::Value) -> uuid::Uuid {
    match h
        .services
        .state
        .ingest
        .ingest(source, payload, None)
        .await
        .unwrap()
    {
        IngestOutcome::Accepted { event_id, .. } => event_id,
        other => panic!("expected a new event, got {other:?}"),
    }
}

async fn status_of(h: &Harness, event_id: uuid::Uuid) -> EventStatus {
    h.services
        .state
        .ledger
        .get(event_id)
        .await
        .unwrap()
        .unwrap()
        .status
}

// ============================================================================
// Propagation
// ============================================================================

#[tokio::test]
async fn test_crm_change_reaches_dialer_with_origin_marker() {
    let h = harness().await;
    let event_id = accepted(&h, EventSource::Crm, crm_contact_payload("C1", "+15551234567")).await;

    let runs = h.services.scheduler.run_until_idle().await.unwrap();
    assert_eq!(runs.len(), 1);
    assert!(matches!(runs[0].outcome, JobOutcome::Done { .. }));
    assert_eq!(status_of(&h, event_id).await, EventStatus::Done);

    let writes = h.systems.writes().await;
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].system, ExternalSystem::Dialer);
    let external_id = writes[0].fields["external_id"].as_str().unwrap();
    assert!(external_id.starts_with(EXTERNAL_ID_PREFIX));

    let log = h
        .services
        .store
        .sync_log()
        .for_event(event_id)
        .await
        .unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].status, SyncLogStatus::Success);
    assert_eq!(log[0].target_id.as_deref(), Some(writes[0].id.as_str()));
}

/// Dialer contact change that the contact handler copies to the CRM
fn dialer_contact_payload(dialer_id: &str, first_name: &str) -> serde_json::Value {
    json!({
        "event_type": "contact.updated",
        "contact_id": dialer_id,
        "firstName": first_name,
        "phone": "+15550001111"
    })
}

#[tokio::test]
async fn test_crm_echo_of_own_write_is_completed_without_writes() {
    let h = harness().await;
    accepted(&h, EventSource::Dialer, dialer_contact_payload("D2", "Ann")).await;
    h.services.scheduler.run_until_idle().await.unwrap();
    let write = h.systems.writes().await.remove(0);
    assert_eq!(write.system, ExternalSystem::Crm);

    // The CRM reports our write back, tag included.
    let echo = json!({
        "event": "contact.updated",
        "contact": { "id": write.id, "firstName": "Ann", "tags": write.fields["tags"] }
    });
    let event_id = accepted(&h, EventSource::Crm, echo).await;

    let runs = h.services.scheduler.run_until_idle().await.unwrap();
    assert!(matches!(
        &runs[0].outcome,
        JobOutcome::Done {
            route: RouteResult::SelfOriginated { .. }
        }
    ));
    assert_eq!(status_of(&h, event_id).await, EventStatus::Done);
    assert_eq!(h.systems.writes().await.len(), 1);

    let log = h
        .services
        .store
        .sync_log()
        .for_event(event_id)
        .await
        .unwrap();
    assert!(log.iter().all(|entry| entry.status != SyncLogStatus::Success));
}

#[tokio::test]
async fn test_later_human_edit_still_propagates() {
    let mut config = test_config(3);
    config.echo_window = Duration::from_millis(50);
    let h = harness_with(config).await;

    accepted(&h, EventSource::Dialer, dialer_contact_payload("D3", "Ann")).await;
    h.services.scheduler.run_until_idle().await.unwrap();
    let write = h.systems.writes().await.remove(0);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Someone renames the contact in the CRM; our tag is still on the record.
    let edit = json!({
        "event": "contact.updated",
        "contact": { "id": write.id, "firstName": "Anna", "tags": write.fields["tags"] }
    });
    let event_id = accepted(&h, EventSource::Crm, edit).await;

    let runs = h.services.scheduler.run_until_idle().await.unwrap();
    assert!(matches!(
        &runs[0].outcome,
        JobOutcome::Done {
            route: RouteResult::Completed { .. }
        }
    ));
    assert_eq!(status_of(&h, event_id).await, EventStatus::Done);

    let writes = h.systems.writes().await;
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[1].system, ExternalSystem::Dialer);
    assert_eq!(writes[1].id, "D3");
}

#[tokio::test]
async fn test_marker_from_unknown_write_is_not_an_echo() {
    let h = harness().await;
    let payload = json!({
        "event": "contact.updated",
        "contact": {
            "id": "C2",
            "phone": "+15550001111",
            "tags": ["vip", format!("{ORIGIN_MARKER}:corr-1")]
        }
    });
    let event_id = accepted(&h, EventSource::Crm, payload).await;

    h.services.scheduler.run_until_idle().await.unwrap();
    assert_eq!(status_of(&h, event_id).await, EventStatus::Done);
    assert_eq!(h.systems.writes().await.len(), 1);
}

#[tokio::test]
async fn test_dialer_echo_of_own_write_is_suppressed() {
    let h = harness().await;
    accepted(&h, EventSource::Crm, crm_contact_payload("C3", "+15552223333")).await;
    h.services.scheduler.run_until_idle().await.unwrap();

    let write = h.systems.writes().await.remove(0);
    let echo = json!({
        "event_type": "contact.updated",
        "contact_id": write.id,
        "external_id": write.fields["external_id"],
    });
    let echo_id = accepted(&h, EventSource::Dialer, echo).await;
    h.services.scheduler.run_until_idle().await.unwrap();

    assert_eq!(status_of(&h, echo_id).await, EventStatus::Done);
    assert_eq!(h.systems.writes().await.len(), 1);
}

#[tokio::test]
async fn test_missing_route_is_visible_as_error() {
    let h = harness().await;
    let event_id = accepted(&h, EventSource::Dialer, dialer_call_payload("C4", "K1")).await;

    let runs = h.services.scheduler.run_until_idle().await.unwrap();
    assert_eq!(runs.len(), 1, "a missing route is not retried");
    assert!(matches!(runs[0].outcome, JobOutcome::Failed { .. }));

    let event = h.services.state.ledger.get(event_id).await.unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Error);
    assert!(event
        .error_message
        .unwrap()
        .contains("no handler registered for dialer/call.completed"));
}

// ============================================================================
// Retry and replay
// ============================================================================

#[tokio::test]
async fn test_three_failures_leave_event_in_error_until_replay() {
    let h = harness().await;
    h.systems
        .fail_next(ExternalSystem::Dialer, "503 from dialer", 3)
        .await;
    let event_id = accepted(&h, EventSource::Crm, crm_contact_payload("C5", "+15554445555")).await;

    let runs = h.services.scheduler.run_until_idle().await.unwrap();
    assert_eq!(runs.len(), 3);
    assert!(matches!(
        runs.last().unwrap().outcome,
        JobOutcome::Failed { .. }
    ));

    let event = h.services.state.ledger.get(event_id).await.unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Error);
    assert_eq!(event.error_message.as_deref(), Some("503 from dialer"));
    // Nothing runs on its own after the limit.
    assert!(h.services.scheduler.run_next().await.unwrap().is_none());

    let replayed = h
        .services
        .state
        .admin
        .replay(event_id, Some("ops"))
        .await
        .unwrap();
    assert_eq!(replayed.status, EventStatus::Pending);

    h.services.scheduler.run_until_idle().await.unwrap();
    let event = h.services.state.ledger.get(event_id).await.unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Done);
    // The original failure stays readable; the audit trail holds every attempt.
    assert_eq!(event.error_message.as_deref(), Some("503 from dialer"));

    let log = h
        .services
        .store
        .sync_log()
        .for_event(event_id)
        .await
        .unwrap();
    let errors = log
        .iter()
        .filter(|e| e.status == SyncLogStatus::Error)
        .count();
    let successes = log
        .iter()
        .filter(|e| e.status == SyncLogStatus::Success)
        .count();
    assert_eq!(errors, 3);
    assert_eq!(successes, 1);
}

// ============================================================================
// Batch operations
// ============================================================================

#[tokio::test]
async fn test_drain_routes_pending_events_oldest_first() {
    let h = harness().await;
    for (i, id) in ["D1", "D2", "D3"].iter().enumerate() {
        accepted(&h, EventSource::Crm, crm_contact_payload(id, &format!("+1555000000{i}"))).await;
    }
    accepted(&h, EventSource::Dialer, dialer_call_payload("D4", "K9")).await;

    let report = h
        .services
        .scheduler
        .drain(&DrainOptions {
            batch_size: 2,
            max_iterations: 10,
            pause: Duration::ZERO,
            source: None,
        })
        .await
        .unwrap();

    assert_eq!(report.processed, 4);
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.errored, 1);
    assert_eq!(report.remaining, 0);
    assert_eq!(report.iterations, 2);

    // The queued jobs find nothing left to claim.
    let runs = h.services.scheduler.run_until_idle().await.unwrap();
    assert!(runs.iter().all(|run| matches!(
        run.outcome,
        JobOutcome::Done {
            route: RouteResult::NotClaimed
        }
    )));
}

#[tokio::test]
async fn test_enqueue_pending_skips_events_with_live_jobs() {
    let h = harness().await;
    let ledger = &h.services.state.ledger;
    for id in ["E1", "E2", "E3"] {
        ledger.insert(&new_event(EventSource::Crm, id)).await.unwrap();
    }

    let first = h.services.scheduler.enqueue_pending(None).await.unwrap();
    assert_eq!(first.scanned, 3);
    assert_eq!(first.enqueued, 3);

    let second = h.services.scheduler.enqueue_pending(None).await.unwrap();
    assert_eq!(second.enqueued, 0);
    assert_eq!(second.already_queued, 3);

    let only_dialer = h
        .services
        .scheduler
        .enqueue_pending(Some(EventSource::Dialer))
        .await
        .unwrap();
    assert_eq!(only_dialer.scanned, 0);
}

#[tokio::test]
async fn test_stale_sweep_recovers_crashed_claim() {
    let mut config = test_config(3);
    config.scheduler.stale_timeout = Duration::ZERO;
    let h = harness_with(config).await;
    let ledger = &h.services.state.ledger;

    let event = ledger
        .insert(&new_event(EventSource::Crm, "S1"))
        .await
        .unwrap();
    // A worker claimed the event and died before finishing it.
    ledger.claim(event.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let released = h.services.scheduler.sweep_stale().await.unwrap();
    assert_eq!(released, 1);
    assert_eq!(status_of(&h, event.id).await, EventStatus::Pending);
    assert!(h
        .services
        .scheduler
        .jobs()
        .has_live_job(event.id)
        .await
        .unwrap());

    let last = ledger.history(event.id).await.unwrap().pop().unwrap();
    assert_eq!(last.actor, "stale-sweep");
}

#[tokio::test]
async fn test_worker_pool_processes_ingested_events() {
    let mut config = test_config(3);
    config.scheduler.poll_interval = Duration::from_millis(10);
    config.scheduler.concurrency = 2;
    let h = harness_with(config).await;

    h.services.scheduler.start().await;
    let event_id = accepted(&h, EventSource::Crm, crm_contact_payload("W1", "+15557778888")).await;

    let mut status = EventStatus::Pending;
    for _ in 0..200 {
        status = status_of(&h, event_id).await;
        if status == EventStatus::Done {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    h.services.scheduler.stop().await;

    assert_eq!(status, EventStatus::Done);
}
