//! Batch drain and bulk enqueue of pending events

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::Scheduler;
use crate::domain::EventSource;
use crate::infra::Result;
use crate::router::RouteResult;

/// Bounds for one drain call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainOptions {
    /// Events fetched per page
    pub batch_size: u32,
    /// Safety cap on pages
    pub max_iterations: u32,
    /// Pause between pages
    #[serde(with = "millis")]
    pub pause: Duration,
    /// Only drain this source
    pub source: Option<EventSource>,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_iterations: 20,
            pause: Duration::from_millis(100),
            source: None,
        }
    }
}

impl DrainOptions {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size: std::env::var("DRAIN_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.batch_size),
            max_iterations: std::env::var("DRAIN_MAX_ITERATIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_iterations),
            pause: std::env::var("DRAIN_PAUSE_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.pause),
            source: None,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Counts from a drain; always returned, even when some events failed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Events this drain claimed and routed
    pub processed: u64,
    pub succeeded: u64,
    pub errored: u64,
    /// Lost the claim to another worker, or quarantined
    pub skipped: u64,
    /// Pending events left afterwards
    pub remaining: u64,
    pub iterations: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnqueueReport {
    pub scanned: u64,
    pub enqueued: u64,
    /// Already had a queued or running job
    pub already_queued: u64,
}

impl Scheduler {
    /// Synchronously route pending events, oldest first, in bounded pages.
    ///
    /// Safe alongside live workers: every event still goes through `claim`.
    #[instrument(skip(self), fields(source = ?options.source))]
    pub async fn drain(&self, options: &DrainOptions) -> Result<DrainReport> {
        let mut report = DrainReport::default();

        while report.iterations < options.max_iterations {
            let page = self
                .ledger
                .pending_page(options.source, options.batch_size.max(1))
                .await?;
            if page.is_empty() {
                break;
            }
            report.iterations += 1;

            for event in page {
                match self.router.dispatch(event.id).await {
                    Ok(RouteResult::NotClaimed) => report.skipped += 1,
                    Ok(route) if route.failure_message().is_some() => {
                        report.processed += 1;
                        report.errored += 1;
                    }
                    Ok(_) => {
                        report.processed += 1;
                        report.succeeded += 1;
                    }
                    Err(e) => {
                        warn!(event_id = %event.id, error = %e, "Drain dispatch failed");
                        report.errored += 1;
                    }
                }
            }

            if !options.pause.is_zero() {
                tokio::time::sleep(options.pause).await;
            }
        }

        report.remaining = self.ledger.count_pending(options.source).await?;
        info!(
            processed = report.processed,
            errored = report.errored,
            remaining = report.remaining,
            iterations = report.iterations,
            "Drain finished"
        );
        Ok(report)
    }

    /// Queue every pending event of `source` (or all sources) that has no live job
    #[instrument(skip(self))]
    pub async fn enqueue_pending(&self, source: Option<EventSource>) -> Result<EnqueueReport> {
        let page_size = self.config.drain.batch_size.max(1);
        let mut report = EnqueueReport::default();
        let mut cursor = 0;

        loop {
            let page = self.ledger.pending_after(source, cursor, page_size).await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = last.seq;

            for event in &page {
                report.scanned += 1;
                if self.jobs.has_live_job(event.id).await? {
                    report.already_queued += 1;
                    continue;
                }
                self.enqueue_event(event).await?;
                report.enqueued += 1;
            }
        }

        info!(
            scanned = report.scanned,
            enqueued = report.enqueued,
            "Pending events enqueued"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventStatus;
    use crate::infra::{EventLedger, SyncError};
    use crate::router::{HandlerOutcome, MockSyncHandler};
    use crate::scheduler::tests::{fixture, insert, scheduler};

    fn quick(batch_size: u32) -> DrainOptions {
        DrainOptions {
            batch_size,
            max_iterations: 10,
            pause: Duration::ZERO,
            source: None,
        }
    }

    #[tokio::test]
    async fn test_drain_counts_outcomes() {
        let f = fixture().await;
        let mut handler = MockSyncHandler::new();
        handler.expect_name().return_const("contact-sync");
        handler.expect_handle().returning(|ctx| {
            if ctx.entity_id == "bad" {
                Err(SyncError::HandlerFailure("422 invalid phone".into()))
            } else {
                Ok(HandlerOutcome::Skipped {
                    reason: "noop".into(),
                })
            }
        });
        let scheduler = scheduler(&f, handler, 3);

        let good = insert(&f, "good").await;
        let bad = insert(&f, "bad").await;
        insert(&f, "other").await;

        let report = scheduler.drain(&quick(2)).await.unwrap();
        assert_eq!(report.processed, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.errored, 1);
        assert_eq!(report.remaining, 0);
        assert_eq!(report.iterations, 2);

        assert_eq!(
            f.ledger.get(good.id).await.unwrap().unwrap().status,
            EventStatus::Done
        );
        let bad = f.ledger.get(bad.id).await.unwrap().unwrap();
        assert_eq!(bad.status, EventStatus::Error);
        assert_eq!(bad.error_message.as_deref(), Some("422 invalid phone"));
    }

    #[tokio::test]
    async fn test_drain_respects_iteration_cap() {
        let f = fixture().await;
        let mut handler = MockSyncHandler::new();
        handler.expect_name().return_const("contact-sync");
        handler.expect_handle().returning(|_| {
            Ok(HandlerOutcome::Skipped {
                reason: "noop".into(),
            })
        });
        let scheduler = scheduler(&f, handler, 3);
        for i in 0..5 {
            insert(&f, &format!("C{i}")).await;
        }

        let options = DrainOptions {
            max_iterations: 2,
            ..quick(1)
        };
        let report = scheduler.drain(&options).await.unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.remaining, 3);
    }

    #[tokio::test]
    async fn test_enqueue_pending_skips_live_jobs() {
        let f = fixture().await;
        let mut handler = MockSyncHandler::new();
        handler.expect_name().return_const("contact-sync");
        let scheduler = scheduler(&f, handler, 3);

        let first = insert(&f, "C1").await;
        insert(&f, "C2").await;
        insert(&f, "C3").await;
        scheduler.enqueue_event(&first).await.unwrap();

        let report = scheduler.enqueue_pending(None).await.unwrap();
        assert_eq!(report.scanned, 3);
        assert_eq!(report.already_queued, 1);
        assert_eq!(report.enqueued, 2);

        let again = scheduler.enqueue_pending(None).await.unwrap();
        assert_eq!(again.enqueued, 0);
    }
}
