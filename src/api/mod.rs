//! HTTP API
//!
//! - `POST /webhooks/:source`: inbound notifications from the CRM, dialer,
//!   messaging and broadcast platforms
//! - `/admin/*`: operator surface, guarded by `x-admin-secret`

pub mod error;
mod handlers;

use axum::routing::{get, post};
use axum::Router;

use crate::server::AppState;

/// Header an upstream may use to pin the correlation id
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Build the unauthenticated webhook router.
pub fn webhook_router() -> Router<AppState> {
    Router::new().route("/webhooks/:source", post(handlers::webhooks::receive_webhook))
}

/// Build the `/admin` router. Callers add the auth layer.
pub fn admin_router() -> Router<AppState> {
    Router::new()
        .route("/events", get(handlers::admin::list_events))
        .route("/events/:event_id", get(handlers::admin::get_event))
        .route("/events/:event_id/replay", post(handlers::admin::replay_event))
        .route(
            "/events/:event_id/mark-done",
            post(handlers::admin::mark_event_done),
        )
        .route(
            "/events/:event_id/quarantine",
            post(handlers::admin::quarantine_event),
        )
        .route("/drain", post(handlers::admin::drain))
        .route("/enqueue-pending", post(handlers::admin::enqueue_pending))
        .route("/reconcile", post(handlers::admin::run_reconcile))
        .route("/reconcile/runs", get(handlers::admin::list_reconcile_runs))
        .route("/catalog/reload", post(handlers::admin::reload_catalog))
}

pub use handlers::health::{health_check, readiness_check};
