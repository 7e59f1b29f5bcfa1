//! Admin authentication middleware for Axum

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use super::{AdminSecret, AuthError, ADMIN_SECRET_HEADER};
use crate::api::error::{ApiError, ErrorCode};

/// Reject requests without a valid `x-admin-secret` header
pub async fn admin_auth_middleware(
    State(secret): State<Arc<AdminSecret>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(ADMIN_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());

    match secret.verify(presented) {
        Ok(()) => next.run(request).await,
        Err(e) => {
            warn!(path = %request.uri().path(), error = %e, "Admin request rejected");
            auth_error_response(e)
        }
    }
}

fn auth_error_response(error: AuthError) -> Response {
    let code = match error {
        AuthError::MissingSecret => ErrorCode::AuthRequired,
        AuthError::InvalidSecret => ErrorCode::InvalidSecret,
    };
    ApiError::new(code, error.to_string()).into_response()
}
