//! df-middleware library
//!
//! Event ledger, claim-based dispatch and list-membership reconciliation
//! between a CRM, a dialer and a messaging platform.
//!
//! ## Modules
//!
//! - [`domain`] - Core domain types (events, jobs, payloads, memberships)
//! - [`infra`] - Durable store (SQLite), error type, retry policy
//! - [`dedupe`] - Dedupe keys and payload fingerprints
//! - [`origin`] - Loop-origin marker detection and stamping
//! - [`collaborators`] - Contract over the external platforms
//! - [`router`] - (source, event type) to handler dispatch
//! - [`handlers`] - Contact and message sync handlers
//! - [`scheduler`] - Job queue workers, retry, drain, stale sweep
//! - [`ingest`] - Webhook body to ledger event
//! - [`membership`] - List-membership reconciler and catalog
//! - [`reconcile`] - Periodic drift repair runs
//! - [`admin`] - Operator operations
//! - [`auth`] - Admin shared-secret check
//! - [`api`] - HTTP routes
//! - [`telemetry`] - Logging setup

pub mod admin;
pub mod api;
pub mod auth;
pub mod collaborators;
pub mod dedupe;
pub mod domain;
pub mod handlers;
pub mod infra;
pub mod ingest;
pub mod membership;
pub mod migrations;
pub mod origin;
pub mod reconcile;
pub mod router;
pub mod scheduler;
pub mod server;
pub mod telemetry;

// Re-export commonly used types
pub use domain::{
    CorrelationId, Event, EventFilter, EventSource, EventStatus, ExternalSystem, Job,
    MembershipChange, NewEvent, ReconcileRun, SyncDirection,
};

pub use infra::{EventLedger, JobQueue, Result, RetryPolicy, Store, SyncError};
pub use ingest::{IngestOutcome, IngestService};
pub use router::{HandlerOutcome, RouteResult, Router, SyncHandler};
pub use scheduler::{Scheduler, SchedulerConfig};
