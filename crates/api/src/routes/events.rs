//! Processed-event audit listing

use accrue_billing::{EventOutcome, ProcessedEvent};
use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crate::error::ApiResult;
use crate::state::AppState;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub outcome: Option<EventOutcome>,
    #[serde(default)]
    pub limit: Option<i64>,
}

pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Vec<ProcessedEvent>>> {
    let billing = state.billing()?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let events = billing.webhooks.list_events(query.outcome, limit).await?;
    Ok(Json(events))
}
