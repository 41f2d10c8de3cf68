//! API error type and its HTTP mapping

use accrue_billing::{BillingError, VerificationError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Server misconfigured: {0}")]
    Config(String),

    #[error("Temporarily unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal server error")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Config(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        match &self {
            ApiError::Internal(detail) => tracing::error!(detail = %detail, "Internal error"),
            ApiError::Config(detail) => tracing::error!(detail = %detail, "Configuration error"),
            ApiError::ServiceUnavailable(detail) => tracing::warn!(detail = %detail, "Transient failure"),
            _ => {}
        }

        // Internal details stay in the log
        let body = Json(json!({
            "error": self.to_string(),
            "code": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::Verification(VerificationError::MissingSecret) => {
                ApiError::Config("webhook secret not configured".to_string())
            }
            BillingError::Verification(v) => ApiError::BadRequest(v.to_string()),
            BillingError::Config(msg) => ApiError::Config(msg),
            BillingError::InvalidInput(msg) => ApiError::BadRequest(msg),
            BillingError::InvalidTier(msg) => ApiError::BadRequest(format!("invalid tier: {}", msg)),
            BillingError::SubscriptionNotFound(user) => {
                ApiError::NotFound(format!("no provider subscription for user {}", user))
            }
            BillingError::VersionConflict { expected, actual, .. } => ApiError::Conflict(format!(
                "subscription changed: expected version {}, found {}",
                expected, actual
            )),
            // Unpinned write that kept losing the race; safe to retry as is
            BillingError::ConflictRetriesExhausted { .. } => {
                ApiError::ServiceUnavailable("subscription is busy, retry shortly".to_string())
            }
            other if other.is_transient() => ApiError::ServiceUnavailable(other.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}
