//! Stripe webhook endpoint

use accrue_billing::{VerificationError, WebhookOutcome, SIGNATURE_HEADER};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: WebhookOutcome,
}

/// Verify, deduplicate and apply one delivery.
///
/// 200 for applied, ignored and duplicate events; 400 when the signature or
/// body is bad; 500 when effects could not be applied so the provider redelivers.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookAck>> {
    let billing = state.billing()?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing Stripe-Signature header".to_string()))?;

    let payload = std::str::from_utf8(&body)
        .map_err(|_| ApiError::BadRequest("webhook body is not valid UTF-8".to_string()))?;

    let event = billing
        .webhooks
        .verify_event(payload, signature)
        .map_err(|e| match e {
            VerificationError::MissingSecret => {
                ApiError::Config("STRIPE_WEBHOOK_SECRET not configured".to_string())
            }
            other => {
                tracing::warn!(error = %other, "Rejected webhook delivery");
                ApiError::BadRequest(other.to_string())
            }
        })?;

    match billing.webhooks.handle_event(&event).await {
        Ok(outcome) => Ok(Json(WebhookAck {
            received: true,
            outcome,
        })),
        Err(e) => {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                transient = e.is_transient(),
                error = %e,
                "Webhook processing failed"
            );
            Err(ApiError::Internal(e.to_string()))
        }
    }
}
