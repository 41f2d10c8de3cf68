#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Accrue shared types
//!
//! Domain enums used by every crate in the workspace, plus Postgres pool
//! creation and the embedded schema migrations.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use types::{AcceleratorAccess, ResourceType, SubscriptionTier};
