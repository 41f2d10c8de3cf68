//! Usage ledger
//!
//! Period-scoped consumption counters checked against the user's current
//! entitlement. The limit check and the increment are one conditional write
//! in the store; nothing here locks.
//!
//! A downgrade never truncates usage: a counter above its new limit simply
//! rejects every increment until the next period key starts a fresh counter.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use accrue_shared::ResourceType;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::entitlement::{resolve, EntitlementSet};
use crate::error::{BillingError, BillingResult};
use crate::store::{IncrementOutcome, UsageStore};
use crate::subscriptions::SubscriptionService;
use crate::tiers::Limit;

/// Billing window identifier, `YYYY-MM` in UTC
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct PeriodKey(String);

impl PeriodKey {
    pub fn for_date(at: OffsetDateTime) -> Self {
        let at = at.to_offset(time::UtcOffset::UTC);
        Self(format!("{:04}-{:02}", at.year(), u8::from(at.month())))
    }

    pub fn current() -> Self {
        Self::for_date(OffsetDateTime::now_utc())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for PeriodKey {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BillingError::InvalidInput(format!("Invalid period key '{}', expected YYYY-MM", s));

        let (year, month) = s.split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        year.parse::<u16>().map_err(|_| invalid())?;
        let month: u8 = month.parse().map_err(|_| invalid())?;
        if !(1..=12).contains(&month) {
            return Err(invalid());
        }

        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of `check_and_increment`. Rejection is a domain outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsageDecision {
    pub accepted: bool,
    pub current: i64,
    pub limit: Limit,
    /// `None` when unbounded
    pub remaining: Option<i64>,
}

/// One resource's consumption for a period
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub resource_type: ResourceType,
    pub period_key: PeriodKey,
    pub current: i64,
    pub limit: Limit,
    pub remaining: Option<i64>,
}

pub struct UsageLedger {
    store: Arc<dyn UsageStore>,
    subscriptions: Arc<SubscriptionService>,
}

impl UsageLedger {
    pub fn new(store: Arc<dyn UsageStore>, subscriptions: Arc<SubscriptionService>) -> Self {
        Self {
            store,
            subscriptions,
        }
    }

    /// Atomically add `amount` to the counter if the result stays within the
    /// limit of the user's current tier.
    pub async fn check_and_increment(
        &self,
        user_id: Uuid,
        resource: ResourceType,
        amount: i64,
        period: &PeriodKey,
    ) -> BillingResult<UsageDecision> {
        if amount <= 0 {
            return Err(BillingError::InvalidInput(format!(
                "usage amount must be positive, got {}",
                amount
            )));
        }

        // Limits come from the stored record, never from the entitlement cache
        let record = self.subscriptions.get_or_create(user_id).await?;
        let limit = resolve(&record).limit_for(resource);

        let outcome = self
            .store
            .try_increment(user_id, resource, period.as_str(), amount, limit)
            .await?;

        let (accepted, current) = match outcome {
            IncrementOutcome::Accepted { current } => (true, current),
            IncrementOutcome::Rejected { current } => (false, current),
        };

        if accepted {
            tracing::debug!(
                user_id = %user_id,
                resource = %resource,
                period = %period,
                amount = amount,
                current = current,
                "Usage recorded"
            );
        } else {
            tracing::info!(
                user_id = %user_id,
                resource = %resource,
                period = %period,
                amount = amount,
                current = current,
                limit = ?limit.as_option(),
                tier = %record.tier,
                "Usage rejected: quota exceeded"
            );
        }

        Ok(UsageDecision {
            accepted,
            current,
            limit,
            remaining: limit.remaining(current),
        })
    }

    /// Counters for every resource type in `period`, against `entitlement`
    pub async fn summary(
        &self,
        user_id: Uuid,
        entitlement: &EntitlementSet,
        period: &PeriodKey,
    ) -> BillingResult<Vec<UsageSnapshot>> {
        let mut snapshots = Vec::with_capacity(ResourceType::ALL.len());

        for resource in ResourceType::ALL {
            let current = self
                .store
                .get_counter(user_id, resource, period.as_str())
                .await?
                .map(|c| c.current)
                .unwrap_or(0);
            let limit = entitlement.limit_for(resource);

            snapshots.push(UsageSnapshot {
                resource_type: resource,
                period_key: period.clone(),
                current,
                limit,
                remaining: limit.remaining(current),
            });
        }

        Ok(snapshots)
    }
}
