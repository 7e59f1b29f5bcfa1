//! Operator handlers under `/admin`.
//!
//! Request bodies are optional wherever every field is; an absent body means
//! "use the defaults".

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::admin::{EventDetail, ReplayResponse};
use crate::api::error::{invalid_body, ApiError};
use crate::domain::{EventFilter, EventSource, ReconcileRun};
use crate::scheduler::{DrainOptions, DrainReport, EnqueueReport};
use crate::server::AppState;

/// Job name recorded for reconcile runs started over HTTP
pub const MANUAL_RECONCILE_JOB: &str = "manual";

const DEFAULT_RUNS_LIMIT: u32 = 20;

#[derive(Debug, Default, Deserialize)]
pub struct ActorRequest {
    pub actor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MarkDoneRequest {
    pub actor: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct QuarantineRequest {
    pub reason: String,
    pub actor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DrainRequest {
    pub batch_size: Option<u32>,
    pub max_iterations: Option<u32>,
    pub pause_ms: Option<u64>,
    pub source: Option<EventSource>,
}

impl DrainRequest {
    fn apply(self, defaults: &DrainOptions) -> DrainOptions {
        DrainOptions {
            batch_size: self.batch_size.unwrap_or(defaults.batch_size).max(1),
            max_iterations: self.max_iterations.unwrap_or(defaults.max_iterations).max(1),
            pause: self
                .pause_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.pause),
            source: self.source.or(defaults.source),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SourceRequest {
    pub source: Option<EventSource>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReconcileRequest {
    pub job_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunsQuery {
    pub limit: Option<u32>,
}

fn parse_event_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| invalid_body(format!("invalid event id: {raw}")))
}

/// GET /admin/events
pub async fn list_events(
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let events = state.admin.list_events(&filter).await?;
    Ok(Json(serde_json::json!({
        "count": events.len(),
        "events": events,
    })))
}

/// GET /admin/events/:event_id
pub async fn get_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<Json<EventDetail>, ApiError> {
    let event_id = parse_event_id(&event_id)?;
    Ok(Json(state.admin.event_detail(event_id).await?))
}

/// POST /admin/events/:event_id/replay
pub async fn replay_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    body: Option<Json<ActorRequest>>,
) -> Result<Json<ReplayResponse>, ApiError> {
    let event_id = parse_event_id(&event_id)?;
    let Json(request) = body.unwrap_or_default();
    Ok(Json(
        state
            .admin
            .replay(event_id, request.actor.as_deref())
            .await?,
    ))
}

/// POST /admin/events/:event_id/mark-done
pub async fn mark_event_done(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    body: Option<Json<MarkDoneRequest>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let event_id = parse_event_id(&event_id)?;
    let Json(request) = body.unwrap_or_default();
    let event = state
        .admin
        .mark_done(event_id, request.actor.as_deref(), request.note.as_deref())
        .await?;
    Ok(Json(serde_json::json!({
        "event_id": event.id,
        "status": event.status,
    })))
}

/// POST /admin/events/:event_id/quarantine
pub async fn quarantine_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    Json(request): Json<QuarantineRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let event_id = parse_event_id(&event_id)?;
    let outcome = state
        .admin
        .quarantine(event_id, &request.reason, request.actor.as_deref())
        .await?;
    Ok(Json(serde_json::json!({
        "event_id": event_id,
        "created": outcome.created,
        "quarantine": outcome.record,
    })))
}

/// POST /admin/drain
pub async fn drain(
    State(state): State<AppState>,
    body: Option<Json<DrainRequest>>,
) -> Result<Json<DrainReport>, ApiError> {
    let Json(request) = body.unwrap_or_default();
    let options = request.apply(state.admin.drain_defaults());
    Ok(Json(state.admin.drain(&options).await?))
}

/// POST /admin/enqueue-pending
pub async fn enqueue_pending(
    State(state): State<AppState>,
    body: Option<Json<SourceRequest>>,
) -> Result<Json<EnqueueReport>, ApiError> {
    let Json(request) = body.unwrap_or_default();
    Ok(Json(state.admin.enqueue_pending(request.source).await?))
}

/// POST /admin/reconcile - run one sweep now
pub async fn run_reconcile(
    State(state): State<AppState>,
    body: Option<Json<ReconcileRequest>>,
) -> Result<Json<ReconcileRun>, ApiError> {
    let Json(request) = body.unwrap_or_default();
    let job_name = request
        .job_name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| MANUAL_RECONCILE_JOB.to_string());
    Ok(Json(state.admin.run_reconcile(&job_name).await?))
}

/// GET /admin/reconcile/runs
pub async fn list_reconcile_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_RUNS_LIMIT).clamp(1, 200);
    let runs = state.admin.recent_reconcile_runs(limit).await?;
    Ok(Json(serde_json::json!({
        "count": runs.len(),
        "runs": runs,
    })))
}

/// POST /admin/catalog/reload
pub async fn reload_catalog(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let rules = state.admin.reload_catalog().await?;
    Ok(Json(serde_json::json!({ "rules": rules })))
}
