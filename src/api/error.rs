//! Structured API error responses with error codes
//!
//! Every failure leaves the API as `{"error": <message>, "code": <CODE>}` with
//! the matching HTTP status and an `x-error-code` header.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::infra::SyncError;

// ============================================================================
// Error Codes
// ============================================================================

/// Stable, machine-readable error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Authentication
    AuthRequired,
    InvalidSecret,

    // Validation
    InvalidRequestBody,
    InvalidFieldValue,
    UnrecognizedPayload,

    // Resources
    EventNotFound,
    ResourceNotFound,
    UnknownSource,

    // Conflicts
    InvalidStateTransition,
    AlreadyClaimed,

    // Infrastructure
    DatabaseError,
    ServiceUnavailable,
    InternalError,
}

impl ErrorCode {
    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorCode::AuthRequired | ErrorCode::InvalidSecret => StatusCode::UNAUTHORIZED,

            ErrorCode::InvalidRequestBody | ErrorCode::InvalidFieldValue => {
                StatusCode::BAD_REQUEST
            }
            ErrorCode::UnrecognizedPayload => StatusCode::UNPROCESSABLE_ENTITY,

            ErrorCode::EventNotFound | ErrorCode::ResourceNotFound | ErrorCode::UnknownSource => {
                StatusCode::NOT_FOUND
            }

            ErrorCode::InvalidStateTransition | ErrorCode::AlreadyClaimed => StatusCode::CONFLICT,

            ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::DatabaseError | ErrorCode::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthRequired => "AUTH_REQUIRED",
            ErrorCode::InvalidSecret => "INVALID_SECRET",
            ErrorCode::InvalidRequestBody => "INVALID_REQUEST_BODY",
            ErrorCode::InvalidFieldValue => "INVALID_FIELD_VALUE",
            ErrorCode::UnrecognizedPayload => "UNRECOGNIZED_PAYLOAD",
            ErrorCode::EventNotFound => "EVENT_NOT_FOUND",
            ErrorCode::ResourceNotFound => "RESOURCE_NOT_FOUND",
            ErrorCode::UnknownSource => "UNKNOWN_SOURCE",
            ErrorCode::InvalidStateTransition => "INVALID_STATE_TRANSITION",
            ErrorCode::AlreadyClaimed => "ALREADY_CLAIMED",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Structured Error Response
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// Human-readable message; the underlying error text
    pub error: String,

    pub code: ErrorCode,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code,
            resource_id: None,
            details: None,
        }
    }

    pub fn with_resource_id(mut self, id: impl Into<String>) -> Self {
        self.resource_id = Some(id.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.code.http_status()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code.as_str();
        let mut response = (status, Json(self)).into_response();

        response.headers_mut().insert(
            axum::http::header::HeaderName::from_static("x-error-code"),
            axum::http::HeaderValue::from_static(code),
        );

        response
    }
}

// ============================================================================
// Conversion from SyncError
// ============================================================================

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        let message = err.to_string();
        match err {
            SyncError::NotFound(what) => {
                let code = if what.starts_with("event ") {
                    ErrorCode::EventNotFound
                } else {
                    ErrorCode::ResourceNotFound
                };
                ApiError::new(code, message)
            }
            SyncError::InvalidTransition { event_id, from, to } => {
                ApiError::new(ErrorCode::InvalidStateTransition, message)
                    .with_resource_id(event_id.to_string())
                    .with_details(serde_json::json!({ "from": from, "to": to }))
            }
            SyncError::AlreadyClaimed(id) => {
                ApiError::new(ErrorCode::AlreadyClaimed, message).with_resource_id(id.to_string())
            }
            SyncError::UnrecognizedPayload { source_name, .. } => {
                ApiError::new(ErrorCode::UnrecognizedPayload, message)
                    .with_details(serde_json::json!({ "source": source_name }))
            }
            SyncError::InvalidInput(_) => ApiError::new(ErrorCode::InvalidFieldValue, message),
            SyncError::Configuration(_) => ApiError::new(ErrorCode::ServiceUnavailable, message),
            SyncError::Database(_) | SyncError::Migration(_) => {
                ApiError::new(ErrorCode::DatabaseError, message)
            }
            SyncError::DuplicateEvent(_)
            | SyncError::NoHandler { .. }
            | SyncError::HandlerFailure(_)
            | SyncError::Serialization(_)
            | SyncError::Internal(_) => ApiError::new(ErrorCode::InternalError, message),
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

pub fn invalid_body(message: impl Into<String>) -> ApiError {
    ApiError::new(ErrorCode::InvalidRequestBody, message)
}

pub fn unknown_source(source: &str) -> ApiError {
    ApiError::new(ErrorCode::UnknownSource, format!("unknown event source: {source}"))
        .with_resource_id(source)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_sync_error_mapping() {
        let not_found: ApiError = SyncError::event_not_found(Uuid::nil()).into();
        assert_eq!(not_found.code, ErrorCode::EventNotFound);
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let conflict: ApiError = SyncError::InvalidTransition {
            event_id: Uuid::nil(),
            from: "processing".into(),
            to: "pending".into(),
        }
        .into();
        assert_eq!(conflict.status(), StatusCode::CONFLICT);

        let db: ApiError = SyncError::Database(sqlx::Error::PoolTimedOut).into();
        assert_eq!(db.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_error_body_shape() {
        let error = ApiError::new(ErrorCode::InvalidSecret, "invalid admin secret");
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"error": "invalid admin secret", "code": "INVALID_SECRET"})
        );
    }

    #[test]
    fn test_response_carries_code_header() {
        let response = ApiError::new(ErrorCode::AuthRequired, "missing").into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()["x-error-code"], "AUTH_REQUIRED");
    }
}
