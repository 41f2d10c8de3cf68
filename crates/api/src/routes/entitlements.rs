//! Entitlement reads and usage recording

use accrue_billing::{EntitlementView, PeriodKey, UsageDecision};
use accrue_shared::ResourceType;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn get_entitlement(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<EntitlementView>> {
    let billing = state.billing()?;
    Ok(Json(billing.sync.get_entitlement(user_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct UsageRequest {
    pub resource_type: ResourceType,
    #[serde(default = "default_amount")]
    pub amount: i64,
    /// `YYYY-MM`; the current UTC month when absent
    #[serde(default)]
    pub period_key: Option<String>,
}

fn default_amount() -> i64 {
    1
}

/// Check-and-increment. A rejected increment is still a 200 with
/// `accepted: false`.
pub async fn record_usage(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    payload: Result<Json<UsageRequest>, JsonRejection>,
) -> ApiResult<Json<UsageDecision>> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let billing = state.billing()?;

    let period = match request.period_key.as_deref() {
        Some(key) => key.parse::<PeriodKey>()?,
        None => PeriodKey::current(),
    };

    let decision = billing
        .usage
        .check_and_increment(user_id, request.resource_type, request.amount, &period)
        .await?;

    Ok(Json(decision))
}
