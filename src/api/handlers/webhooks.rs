//! Inbound webhook handler.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use tracing::{debug, warn};

use crate::api::error::{unknown_source, ApiError};
use crate::api::CORRELATION_ID_HEADER;
use crate::domain::{CorrelationId, EventSource};
use crate::ingest::IngestOutcome;
use crate::server::AppState;

/// Decode a webhook body. Bodies that are not JSON are kept as a string so
/// the rejection is still recorded in the ledger.
fn decode_body(body: &[u8]) -> serde_json::Value {
    serde_json::from_slice(body)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(body).into_owned()))
}

fn correlation_from(headers: &HeaderMap) -> Option<CorrelationId> {
    headers
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| CorrelationId(v.to_string()))
}

/// POST /webhooks/:source
///
/// `202 Accepted` when a new event was recorded and queued, `200 OK` with
/// `"duplicate": true` when the same content was already recorded.
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let source: EventSource = source.parse().map_err(|_| {
        warn!(%source, "Webhook for unknown source");
        unknown_source(&source)
    })?;

    let raw = decode_body(&body);
    let outcome = state
        .ingest
        .ingest(source, raw, correlation_from(&headers))
        .await?;

    match outcome {
        IngestOutcome::Accepted { event_id, job_id } => {
            debug!(%event_id, %job_id, "Webhook accepted");
            Ok((
                StatusCode::ACCEPTED,
                Json(serde_json::json!({
                    "status": "accepted",
                    "duplicate": false,
                    "event_id": event_id,
                    "job_id": job_id,
                })),
            ))
        }
        IngestOutcome::Duplicate { existing_id } => Ok((
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "duplicate",
                "duplicate": true,
                "event_id": existing_id,
            })),
        )),
    }
}
