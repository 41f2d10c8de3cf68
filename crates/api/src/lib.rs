// API crate clippy configuration
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Accrue API Library
//!
//! HTTP surface of the entitlement core: the Stripe webhook endpoint, the
//! action-dispatch RPC used by checkout and portal flows, entitlement and
//! usage endpoints, and health.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
