//! Action-dispatch RPC used by checkout and portal flows
//!
//! Requests are `{ "action": "...", ...params }`. Every failure is answered as
//! a JSON error with a non-200 status.

use accrue_billing::{EntitlementView, SubscriptionUpdate, SubscriptionView};
use accrue_shared::{AcceleratorAccess, SubscriptionTier};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BillingAction {
    GetSubscriptionStatus {
        user_id: Uuid,
    },
    UpdateUserSubscription {
        user_id: Uuid,
        #[serde(default)]
        tier: Option<SubscriptionTier>,
        #[serde(default)]
        accelerator_access: Option<AcceleratorAccess>,
        #[serde(default)]
        expected_version: Option<i64>,
    },
    CancelSubscription {
        user_id: Uuid,
    },
    ResumeSubscription {
        user_id: Uuid,
    },
    CheckoutCompleted {
        user_id: Uuid,
        customer_id: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ActionResponse {
    Status(EntitlementView),
    Subscription(SubscriptionView),
}

pub async fn dispatch(
    State(state): State<AppState>,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> ApiResult<Json<ActionResponse>> {
    let Json(value) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let action: BillingAction = serde_json::from_value(value)
        .map_err(|e| ApiError::BadRequest(format!("invalid action: {}", e)))?;

    let billing = state.billing()?;
    let sync = &billing.sync;

    let response = match action {
        BillingAction::GetSubscriptionStatus { user_id } => {
            ActionResponse::Status(sync.get_entitlement(user_id).await?)
        }
        BillingAction::UpdateUserSubscription {
            user_id,
            tier,
            accelerator_access,
            expected_version,
        } => {
            if tier.is_none() && accelerator_access.is_none() {
                return Err(ApiError::BadRequest(
                    "update_user_subscription needs tier or accelerator_access".to_string(),
                ));
            }

            let update = SubscriptionUpdate {
                tier,
                accelerator_access,
                expected_version,
            };
            ActionResponse::Subscription(sync.update_user_subscription(user_id, update).await?)
        }
        BillingAction::CancelSubscription { user_id } => {
            ActionResponse::Subscription(sync.cancel_subscription(user_id).await?)
        }
        BillingAction::ResumeSubscription { user_id } => {
            ActionResponse::Subscription(sync.resume_subscription(user_id).await?)
        }
        BillingAction::CheckoutCompleted {
            user_id,
            customer_id,
        } => {
            if customer_id.trim().is_empty() {
                return Err(ApiError::BadRequest("customer_id must not be empty".to_string()));
            }
            ActionResponse::Subscription(sync.record_checkout_completed(user_id, &customer_id).await?)
        }
    };

    Ok(Json(response))
}
