//! Service-token authentication for internal routes

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;

use crate::error::ApiError;
use crate::state::AppState;

/// Require `Authorization: Bearer <INTERNAL_API_TOKEN>`.
///
/// Without a configured token the routes are closed rather than open.
pub async fn require_service_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let expected = state
        .config
        .internal_api_token
        .as_deref()
        .ok_or_else(|| ApiError::Config("INTERNAL_API_TOKEN not configured".to_string()))?;

    let provided = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    if !bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        tracing::warn!(path = %request.uri().path(), "Rejected internal request with bad token");
        return Err(ApiError::Unauthorized);
    }

    Ok(next.run(request).await)
}
