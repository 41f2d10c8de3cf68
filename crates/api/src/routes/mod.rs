pub mod actions;
pub mod entitlements;
pub mod events;
pub mod health;
pub mod webhooks;


use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::auth::require_service_token;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let internal = Router::new()
        .route("/api/v1/billing/actions", post(actions::dispatch))
        .route("/api/v1/billing/events", get(events::list_events))
        .route(
            "/api/v1/users/{user_id}/entitlement",
            get(entitlements::get_entitlement),
        )
        .route("/api/v1/users/{user_id}/usage", post(entitlements::record_usage))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_service_token,
        ));

    Router::new()
        .route("/health", get(health::health))
        // Authenticated by the provider signature, not the service token
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .merge(internal)
        .with_state(state)
}
