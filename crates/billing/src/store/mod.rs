//! Persistence for the entitlement core
//!
//! Three keyed collections, each behind its own trait so services only see the
//! operations they need:
//!
//! - `SubscriptionStore`: one versioned record per user, conditional writes only
//! - `ProcessedEventStore`: one row per provider event id, insert-if-absent
//! - `UsageStore`: one counter per (user, resource, period), conditional increment
//!
//! Every mutating method is a single atomic step at the storage layer. Callers
//! never lock.

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

use accrue_shared::{AcceleratorAccess, ResourceType, SubscriptionTier};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::tiers::Limit;

// =============================================================================
// Records
// =============================================================================

/// Authoritative subscription state for one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct SubscriptionRecord {
    pub user_id: Uuid,
    pub tier: SubscriptionTier,
    pub provider_customer_id: Option<String>,
    pub provider_subscription_id: Option<String>,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_end: Option<OffsetDateTime>,
    pub accelerator_access: AcceleratorAccess,
    pub total_paid_cents: i64,
    /// Successful payments counted toward an installment plan
    pub installment_payments: i32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_payment_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub payment_failed_at: Option<OffsetDateTime>,
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

impl SubscriptionRecord {
    /// Record created on first entitlement check: lowest tier, version 1
    pub fn new_default(user_id: Uuid, now: OffsetDateTime) -> Self {
        Self {
            user_id,
            tier: SubscriptionTier::Starter,
            provider_customer_id: None,
            provider_subscription_id: None,
            cancel_at_period_end: false,
            period_end: None,
            accelerator_access: AcceleratorAccess::None,
            total_paid_cents: 0,
            installment_payments: 0,
            last_payment_at: None,
            payment_failed_at: None,
            version: 1,
            created_at: now,
            last_updated: now,
        }
    }

    /// Every payment of the installment plan has been received
    pub fn installment_plan_complete(&self, installment_payment_count: u32) -> bool {
        installment_payment_count > 0
            && i64::from(self.installment_payments) >= i64::from(installment_payment_count)
    }
}

/// Result of processing a provider event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EventOutcome {
    /// Claimed, effects not yet recorded
    Processing,
    Applied,
    Ignored,
    Failed,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Processing => "processing",
            EventOutcome::Applied => "applied",
            EventOutcome::Ignored => "ignored",
            EventOutcome::Failed => "failed",
        }
    }
}

impl std::fmt::Display for EventOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dedup row for one provider event id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct ProcessedEvent {
    pub provider_event_id: String,
    pub event_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    /// Start of the current processing attempt; the claim lapses after the lease
    #[serde(with = "time::serde::rfc3339")]
    pub claimed_at: OffsetDateTime,
    pub outcome: EventOutcome,
    /// Failed without committing anything; a later delivery may reclaim it
    pub retryable: bool,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

/// Outcome of the insert-if-absent claim on a provider event id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResult {
    Claimed,
    Exists(ProcessedEvent),
}

/// Consumption counter for one (user, resource, period)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct UsageCounter {
    pub user_id: Uuid,
    pub resource_type: ResourceType,
    pub period_key: String,
    pub current: i64,
    /// Limit in force at the last successful increment (`None` = unbounded)
    pub limit_value: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Outcome of a conditional increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementOutcome {
    Accepted { current: i64 },
    Rejected { current: i64 },
}

// =============================================================================
// Traits
// =============================================================================

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get_subscription(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>>;

    /// Insert `record` unless the user already has one; returns whichever is stored
    async fn create_subscription_if_absent(
        &self,
        record: &SubscriptionRecord,
    ) -> BillingResult<SubscriptionRecord>;

    /// Persist `record` only if the stored version still equals `expected_version`.
    ///
    /// `record.version` must be `expected_version + 1`. Returns `Ok(false)` when
    /// another writer committed first.
    async fn compare_and_swap_subscription(
        &self,
        record: &SubscriptionRecord,
        expected_version: i64,
    ) -> BillingResult<bool>;

    /// Secondary index: provider customer id -> user id
    async fn find_user_by_customer(&self, customer_id: &str) -> BillingResult<Option<Uuid>>;

    /// One page of records linked to a provider subscription, ordered by user id.
    /// Pass the last user id of the previous page as `after` to continue.
    async fn list_provider_linked(
        &self,
        after: Option<Uuid>,
        limit: i64,
    ) -> BillingResult<Vec<SubscriptionRecord>>;
}

#[async_trait]
pub trait ProcessedEventStore: Send + Sync {
    /// Insert a `processing` row unless one already exists for `event_id`
    async fn try_claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        received_at: OffsetDateTime,
    ) -> BillingResult<ClaimResult>;

    /// Conditional transition back to `processing` with `claimed_at = now`.
    ///
    /// Succeeds for a retryable failure, or for a `processing` row whose
    /// `claimed_at` is before `stale_before`. Only one caller wins.
    async fn reclaim_event(
        &self,
        event_id: &str,
        now: OffsetDateTime,
        stale_before: OffsetDateTime,
    ) -> BillingResult<bool>;

    async fn record_outcome(
        &self,
        event_id: &str,
        outcome: EventOutcome,
        error_message: Option<&str>,
        retryable: bool,
    ) -> BillingResult<()>;

    async fn get_event(&self, event_id: &str) -> BillingResult<Option<ProcessedEvent>>;

    /// Most recent first
    async fn list_events(
        &self,
        outcome: Option<EventOutcome>,
        limit: i64,
    ) -> BillingResult<Vec<ProcessedEvent>>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Create the counter at zero if absent, then add `amount` only if the
    /// result stays within `limit`. One atomic step.
    async fn try_increment(
        &self,
        user_id: Uuid,
        resource: ResourceType,
        period_key: &str,
        amount: i64,
        limit: Limit,
    ) -> BillingResult<IncrementOutcome>;

    async fn get_counter(
        &self,
        user_id: Uuid,
        resource: ResourceType,
        period_key: &str,
    ) -> BillingResult<Option<UsageCounter>>;
}
