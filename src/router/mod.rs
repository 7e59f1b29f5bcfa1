//! Event router
//!
//! Maps `(source, event type)` to a [`SyncHandler`] and turns the handler's
//! result into a ledger transition. The router never retries; the scheduler
//! decides when a failed event runs again.
//!
//! Order of checks for a claimed event:
//! 1. echo of one of our own recent writes: complete as a no-op
//! 2. no handler registered: fail with the `NoHandler` message
//! 3. handler (with timeout), then membership outcome, then complete or fail

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    ContactAttributes, CorrelationId, Event, EventSource, ExternalSystem, MembershipChange,
    SyncDirection, SyncLogEntry, SyncLogStatus,
};
use crate::infra::{EventLedger, Result, SqliteSyncLog, SyncError};
use crate::membership::MembershipReconciler;
use crate::origin::detect_origin;

/// Default upper bound on one handler call
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// Default age after which an origin marker no longer identifies an echo
pub const DEFAULT_ECHO_WINDOW: Duration = Duration::from_secs(120);

/// What a handler sees of an event
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub event_id: Uuid,
    pub source: EventSource,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub correlation_id: CorrelationId,
}

impl From<&Event> for HandlerContext {
    fn from(event: &Event) -> Self {
        Self {
            event_id: event.id,
            source: event.source,
            event_type: event.event_type.clone(),
            entity_type: event.entity_type.clone(),
            entity_id: event.entity_id.clone(),
            payload: event.payload.clone(),
            correlation_id: event.correlation_id.clone(),
        }
    }
}

/// Successful handler result
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandlerOutcome {
    /// The change was written to another system
    Synced {
        target_id: Option<String>,
        direction: SyncDirection,
        /// Present when the contact's list memberships should be reconciled
        contact: Option<ContactAttributes>,
    },
    /// Apply this membership change and nothing else
    Membership(MembershipChange),
    /// Nothing to do for this event
    Skipped { reason: String },
}

/// Propagates one kind of event to the other systems
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SyncHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, ctx: &HandlerContext) -> Result<HandlerOutcome>;
}

/// How a routed event ended up
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RouteResult {
    Completed {
        handler: String,
        outcome: HandlerOutcome,
    },
    /// Echo of this system's own write; completed without dispatch
    SelfOriginated { origin_id: Option<String> },
    /// Claim lost, event quarantined or missing; nothing was done
    NotClaimed,
    NoHandler { message: String },
    Failed { handler: String, message: String },
}

impl RouteResult {
    /// Error message recorded on the event, if routing failed
    pub fn failure_message(&self) -> Option<&str> {
        match self {
            RouteResult::NoHandler { message } | RouteResult::Failed { message, .. } => {
                Some(message)
            }
            _ => None,
        }
    }

    /// Retrying cannot fix a missing route
    pub fn is_retryable_failure(&self) -> bool {
        matches!(self, RouteResult::Failed { .. })
    }
}

pub struct Router {
    ledger: Arc<dyn EventLedger>,
    sync_log: SqliteSyncLog,
    reconciler: Arc<MembershipReconciler>,
    handlers: HashMap<(EventSource, String), Arc<dyn SyncHandler>>,
    handler_timeout: Duration,
    echo_window: Duration,
}

impl Router {
    pub fn new(
        ledger: Arc<dyn EventLedger>,
        sync_log: SqliteSyncLog,
        reconciler: Arc<MembershipReconciler>,
    ) -> Self {
        Self {
            ledger,
            sync_log,
            reconciler,
            handlers: HashMap::new(),
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            echo_window: DEFAULT_ECHO_WINDOW,
        }
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_echo_window(mut self, window: Duration) -> Self {
        self.echo_window = window;
        self
    }

    /// Register a handler for an exact event type, or `entity.*` for a family
    pub fn register(&mut self, source: EventSource, event_type: &str, handler: Arc<dyn SyncHandler>) {
        self.handlers
            .insert((source, event_type.to_string()), handler);
    }

    pub fn handler_for(&self, source: EventSource, event_type: &str) -> Option<Arc<dyn SyncHandler>> {
        if let Some(h) = self.handlers.get(&(source, event_type.to_string())) {
            return Some(h.clone());
        }
        let family = event_type.split('.').next().unwrap_or(event_type);
        self.handlers.get(&(source, format!("{family}.*"))).cloned()
    }

    pub fn ledger(&self) -> &Arc<dyn EventLedger> {
        &self.ledger
    }

    /// Claim an event and route it
    #[instrument(skip(self))]
    pub async fn dispatch(&self, event_id: Uuid) -> Result<RouteResult> {
        if self.ledger.is_quarantined(event_id).await? {
            debug!("Event quarantined, skipping dispatch");
            return Ok(RouteResult::NotClaimed);
        }
        if !self.ledger.claim(event_id).await?.is_claimed() {
            return Ok(RouteResult::NotClaimed);
        }

        let event = self
            .ledger
            .get(event_id)
            .await?
            .ok_or_else(|| SyncError::event_not_found(event_id))?;
        self.route(&event).await
    }

    /// Route an event this caller has already claimed
    #[instrument(
        skip(self, event),
        fields(event_id = %event.id, source = %event.source, correlation_id = %event.correlation_id)
    )]
    pub async fn route(&self, event: &Event) -> Result<RouteResult> {
        let origin = detect_origin(event.source, &event.payload);
        if origin.is_origin && self.is_echo(event, origin.origin_id.as_deref()).await? {
            info!(origin_id = ?origin.origin_id, "Self-originated echo, completing as no-op");
            self.log(event, SyncLogStatus::Skipped, None, None, Some("self-originated echo"))
                .await?;
            self.ledger.complete(event.id).await?;
            return Ok(RouteResult::SelfOriginated {
                origin_id: origin.origin_id,
            });
        }

        let Some(handler) = self.handler_for(event.source, &event.event_type) else {
            let message = SyncError::NoHandler {
                source_name: event.source.to_string(),
                event_type: event.event_type.clone(),
            }
            .to_string();
            warn!(event_type = %event.event_type, "No handler registered");
            self.log(event, SyncLogStatus::Error, None, None, Some(&message))
                .await?;
            self.ledger.fail(event.id, &message).await?;
            return Ok(RouteResult::NoHandler { message });
        };

        let ctx = HandlerContext::from(event);
        let result = match tokio::time::timeout(self.handler_timeout, handler.handle(&ctx)).await {
            Ok(Ok(outcome)) => match self.apply_outcome(&outcome, &event.correlation_id).await {
                Ok(()) => Ok(outcome),
                Err(e) => Err(e.to_string()),
            },
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "timeout: handler {} exceeded {}ms",
                handler.name(),
                self.handler_timeout.as_millis()
            )),
        };

        match result {
            Ok(outcome) => {
                match &outcome {
                    HandlerOutcome::Synced {
                        target_id,
                        direction,
                        ..
                    } => {
                        self.log(
                            event,
                            SyncLogStatus::Success,
                            Some(*direction),
                            target_id.clone(),
                            None,
                        )
                        .await?
                    }
                    HandlerOutcome::Membership(_) => {
                        self.log(event, SyncLogStatus::Success, None, None, None)
                            .await?
                    }
                    HandlerOutcome::Skipped { reason } => {
                        self.log(event, SyncLogStatus::Skipped, None, None, Some(reason))
                            .await?
                    }
                }
                self.ledger.complete(event.id).await?;
                debug!(handler = handler.name(), "Event completed");
                Ok(RouteResult::Completed {
                    handler: handler.name().to_string(),
                    outcome,
                })
            }
            Err(message) => {
                warn!(handler = handler.name(), error = %message, "Handler failed");
                self.log(event, SyncLogStatus::Error, None, None, Some(&message))
                    .await?;
                self.ledger.fail(event.id, &message).await?;
                Ok(RouteResult::Failed {
                    handler: handler.name().to_string(),
                    message,
                })
            }
        }
    }

    /// Whether a marked event echoes a write we made to its system within the echo window.
    ///
    /// The marker stays on the remote record after our write, so a marker
    /// naming an old or unknown write is a later change by someone else.
    /// A bare marker carries nothing to check and always counts.
    async fn is_echo(&self, event: &Event, origin_id: Option<&str>) -> Result<bool> {
        let (Some(origin_id), Some(system)) = (origin_id, ExternalSystem::for_source(event.source))
        else {
            return Ok(true);
        };
        let window = chrono::Duration::from_std(self.echo_window)
            .map_err(|e| SyncError::Configuration(format!("echo window out of range: {e}")))?;

        let write = self
            .sync_log
            .recent_write(system, &CorrelationId::from(origin_id), Utc::now() - window)
            .await?;
        if write.is_none() {
            debug!(origin_id, "Origin marker matches no recent write, routing as a change");
        }
        Ok(write.is_some())
    }

    async fn apply_outcome(&self, outcome: &HandlerOutcome, correlation_id: &CorrelationId) -> Result<()> {
        match outcome {
            HandlerOutcome::Synced {
                contact: Some(attrs),
                ..
            } => {
                self.reconciler
                    .reconcile_contact(attrs, correlation_id)
                    .await?;
            }
            HandlerOutcome::Membership(change) => {
                self.reconciler.apply_membership_change(change).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn log(
        &self,
        event: &Event,
        status: SyncLogStatus,
        direction: Option<SyncDirection>,
        target_id: Option<String>,
        message: Option<&str>,
    ) -> Result<()> {
        let mut entry = SyncLogEntry::new(
            event.entity_type.clone(),
            event.entity_id.clone(),
            status,
            event.correlation_id.clone(),
        )
        .with_target(target_id)
        .with_event(event.id);
        if let Some(direction) = direction {
            entry = entry.with_direction(direction);
        }
        if let Some(message) = message {
            entry = entry.with_error(message);
        }
        self.sync_log.append(&entry).await?;
        Ok(())
    }
}
