//! Job scheduler
//!
//! Owns the "when" of dispatch. Jobs in the durable queue point at ledger
//! events; a pool of tokio workers pulls due jobs, hands the event to the
//! [`Router`] and applies the [`RetryPolicy`] to the outcome.
//!
//! Retry flow for a failing handler with `max_attempts = 3`:
//!
//! ```text
//! attempt 1: route -> fail()   replay(), job back in queue after backoff
//! attempt 2: route -> fail()   replay(), job back in queue after backoff
//! attempt 3: route -> fail()   job failed, event stays in `error`
//! ```
//!
//! After the last attempt only an administrative replay runs the event again.

mod drain;

pub use drain::{DrainOptions, DrainReport, EnqueueReport};

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{Event, Job, JobPayload, DISPATCH_QUEUE};
use crate::infra::{EventLedger, JobQueue, Result, RetryPolicy};
use crate::router::{RouteResult, Router};

/// Actor recorded on ledger transitions made by automatic retries
pub const RETRY_ACTOR: &str = "scheduler-retry";

/// Actor recorded on transitions made by the stale-processing sweep
pub const STALE_SWEEP_ACTOR: &str = "stale-sweep";

/// Scheduler settings
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker tasks
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Idle wait between polls when the queue is empty
    pub poll_interval: Duration,
    /// Events `processing` longer than this are returned to `pending`
    pub stale_timeout: Duration,
    pub sweep_interval: Duration,
    /// Push-back for a job whose entity is already being dispatched
    pub busy_delay: Duration,
    pub drain: DrainOptions,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_millis(500),
            stale_timeout: Duration::from_secs(900),
            sweep_interval: Duration::from_secs(60),
            busy_delay: Duration::from_millis(250),
            drain: DrainOptions::default(),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from environment
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let concurrency = std::env::var("WORKER_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(defaults.concurrency);

        let max_attempts = std::env::var("JOB_MAX_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.retry.max_attempts);

        let base_delay = std::env::var("RETRY_BASE_DELAY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry.base_delay);

        let max_delay = std::env::var("RETRY_MAX_DELAY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry.max_delay);

        let poll_interval = std::env::var("SCHEDULER_POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);

        let stale_timeout = std::env::var("STALE_PROCESSING_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.stale_timeout);

        let sweep_interval = std::env::var("STALE_SWEEP_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.sweep_interval);

        Self {
            concurrency,
            retry: defaults
                .retry
                .with_max_attempts(max_attempts)
                .with_base_delay(base_delay)
                .with_max_delay(max_delay),
            poll_interval,
            stale_timeout,
            sweep_interval,
            busy_delay: defaults.busy_delay,
            drain: DrainOptions::from_env(),
        }
    }
}

/// What happened to one pulled job
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    /// Routed without a retryable failure; the job is finished
    Done { route: RouteResult },
    /// Failed attempt; the event was replayed and the job runs again at `run_at`
    Retrying {
        attempt: u32,
        run_at: DateTime<Utc>,
        message: String,
    },
    /// No attempts left (or the failure cannot be retried); the event stays in `error`
    Failed { message: String },
    /// Another worker is dispatching the same entity
    Deferred { run_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRun {
    pub job_id: Uuid,
    pub event_id: Uuid,
    pub attempt: u32,
    pub outcome: JobOutcome,
}

/// Entities currently being dispatched by this process
type InFlight = Arc<Mutex<HashSet<String>>>;

/// Releases the entity when the dispatch finishes, however it finishes
struct InFlightGuard {
    set: InFlight,
    entity_id: String,
}

impl InFlightGuard {
    fn acquire(set: &InFlight, entity_id: &str) -> Option<Self> {
        let mut held = set.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(entity_id.to_string()) {
            return None;
        }
        Some(Self {
            set: set.clone(),
            entity_id: entity_id.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut held = self.set.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.entity_id);
    }
}

fn after(delay: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

pub struct Scheduler {
    ledger: Arc<dyn EventLedger>,
    jobs: Arc<dyn JobQueue>,
    router: Arc<Router>,
    config: SchedulerConfig,
    in_flight: InFlight,
    shutdown: watch::Sender<bool>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(router: Arc<Router>, jobs: Arc<dyn JobQueue>, config: SchedulerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            ledger: router.ledger().clone(),
            jobs,
            router,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            shutdown,
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn jobs(&self) -> &Arc<dyn JobQueue> {
        &self.jobs
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Flips to `true` when `stop` is called
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Durably queue a unit of work
    pub async fn enqueue(&self, queue: &str, payload: &JobPayload) -> Result<Job> {
        self.jobs
            .enqueue(queue, payload, self.config.retry.max_attempts, Utc::now())
            .await
    }

    /// Queue an event on the dispatch queue
    pub async fn enqueue_event(&self, event: &Event) -> Result<Job> {
        self.enqueue(
            DISPATCH_QUEUE,
            &JobPayload {
                event_id: event.id,
                entity_id: event.entity_id.clone(),
            },
        )
        .await
    }

    /// Reset an event to `pending` and queue it again
    #[instrument(skip(self))]
    pub async fn replay(&self, event_id: Uuid, actor: &str) -> Result<(Event, Job)> {
        let event = self.ledger.replay(event_id, actor).await?;
        let job = self.enqueue_event(&event).await?;
        info!(job_id = %job.id, "Event replayed");
        Ok((event, job))
    }

    /// Spawn the worker pool and the stale sweep
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            warn!("Scheduler already started");
            return;
        }
        self.shutdown.send_replace(false);

        info!(
            concurrency = self.config.concurrency,
            max_attempts = self.config.retry.max_attempts,
            stale_timeout_secs = self.config.stale_timeout.as_secs(),
            "Starting scheduler"
        );

        for worker in 0..self.config.concurrency {
            let scheduler = self.clone();
            let shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                scheduler.worker_loop(worker, shutdown).await
            }));
        }

        let scheduler = self.clone();
        let shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move { scheduler.sweep_loop(shutdown).await }));
    }

    /// Signal shutdown and wait for in-flight jobs to finish
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Scheduler task panicked");
            }
        }
        info!("Scheduler stopped");
    }

    async fn worker_loop(self: Arc<Self>, worker: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker, "Worker started");
        while !*shutdown.borrow() {
            match self.run_next().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => error!(worker, error = %e, "Error running job"),
            }

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        debug!(worker, "Worker stopped");
    }

    async fn sweep_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_stale().await {
                        error!(error = %e, "Stale sweep failed");
                    }
                }
            }
        }
    }

    /// Pull and process one due job. `Ok(None)` when nothing is due.
    pub async fn run_next(&self) -> Result<Option<JobRun>> {
        let Some(job) = self.jobs.fetch_next(DISPATCH_QUEUE).await? else {
            return Ok(None);
        };
        let outcome = self.process_job(&job).await?;
        Ok(Some(JobRun {
            job_id: job.id,
            event_id: job.event_id,
            attempt: job.attempts,
            outcome,
        }))
    }

    /// Run jobs until none is due; returns what ran
    pub async fn run_until_idle(&self) -> Result<Vec<JobRun>> {
        let mut runs = Vec::new();
        while let Some(run) = self.run_next().await? {
            runs.push(run);
        }
        Ok(runs)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, event_id = %job.event_id, attempt = job.attempts))]
    async fn process_job(&self, job: &Job) -> Result<JobOutcome> {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, &job.entity_id) else {
            let run_at = after(self.config.busy_delay);
            self.jobs.defer(job.id, run_at).await?;
            debug!(entity_id = %job.entity_id, "Entity busy, job deferred");
            return Ok(JobOutcome::Deferred { run_at });
        };

        let route = match self.router.dispatch(job.event_id).await {
            Ok(route) => route,
            Err(e) => {
                // The event may be left `processing`; the stale sweep returns it.
                let message = e.to_string();
                warn!(error = %message, "Dispatch failed");
                return self.retry_or_fail(job, message, false).await;
            }
        };

        if route.is_retryable_failure() {
            let message = route.failure_message().unwrap_or_default().to_string();
            return self.retry_or_fail(job, message, true).await;
        }

        if let Some(message) = route.failure_message() {
            let message = message.to_string();
            self.jobs.mark_failed(job.id, &message).await?;
            return Ok(JobOutcome::Failed { message });
        }

        self.jobs.mark_done(job.id).await?;
        Ok(JobOutcome::Done { route })
    }

    async fn retry_or_fail(&self, job: &Job, message: String, replay: bool) -> Result<JobOutcome> {
        if !self.config.retry.allows_retry(job.attempts) {
            warn!(attempts = job.attempts, error = %message, "Retry limit reached");
            self.jobs.mark_failed(job.id, &message).await?;
            return Ok(JobOutcome::Failed { message });
        }

        if replay {
            self.ledger.replay(job.event_id, RETRY_ACTOR).await?;
        }

        let run_at = after(
            self.config
                .retry
                .delay_for_attempt(job.attempts.saturating_sub(1)),
        );
        self.jobs.retry_later(job.id, &message, run_at).await?;
        info!(attempt = job.attempts, run_at = %run_at, "Job scheduled for retry");

        Ok(JobOutcome::Retrying {
            attempt: job.attempts,
            run_at,
            message,
        })
    }

    /// Return stuck `processing` events to `pending` and requeue them
    #[instrument(skip(self))]
    pub async fn sweep_stale(&self) -> Result<u64> {
        let released = self
            .ledger
            .requeue_stale(self.config.stale_timeout, STALE_SWEEP_ACTOR)
            .await?;
        let jobs = self.jobs.requeue_stale(self.config.stale_timeout).await?;

        for event_id in &released {
            if self.jobs.has_live_job(*event_id).await? {
                continue;
            }
            if let Some(event) = self.ledger.get(*event_id).await? {
                self.enqueue_event(&event).await?;
            }
        }

        if !released.is_empty() || jobs > 0 {
            info!(events = released.len(), jobs, "Stale work requeued");
        }
        Ok(released.len() as u64)
    }
}
