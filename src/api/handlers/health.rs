//! Health and readiness handlers.

use axum::extract::State;
use axum::Json;

use crate::api::error::{ApiError, ErrorCode};
use crate::server::AppState;

/// GET /health
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "df-middleware",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /ready - database reachable and pending backlog size
pub async fn readiness_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.ledger.count_pending(None).await {
        Ok(pending) => Ok(Json(serde_json::json!({
            "status": "ready",
            "database": "connected",
            "pending_events": pending,
        }))),
        Err(e) => Err(ApiError::new(
            ErrorCode::ServiceUnavailable,
            format!("Database unavailable: {e}"),
        )),
    }
}
