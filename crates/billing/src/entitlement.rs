//! Entitlement resolution
//!
//! Pure derivation of what a user may do from their subscription record and
//! the tier catalog.

use accrue_shared::ResourceType;
use serde::Serialize;

use crate::store::SubscriptionRecord;
use crate::tiers::{Limit, TierDefinition};

/// Resolved features and quotas for one user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntitlementSet {
    pub max_transactions: Limit,
    pub max_reports: Limit,
    pub max_users: Limit,
    pub can_export_data: bool,
    pub has_advanced_analytics: bool,
    pub has_accelerator_access: bool,
    pub has_phone_support: bool,
    pub has_custom_branding: bool,
}

impl EntitlementSet {
    pub fn limit_for(&self, resource: ResourceType) -> Limit {
        match resource {
            ResourceType::Transactions => self.max_transactions,
            ResourceType::Reports => self.max_reports,
            ResourceType::TeamSeats => self.max_users,
        }
    }
}

/// Subscription lifecycle as seen by the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Starter,
    Active,
    Canceling,
}

pub fn resolve(record: &SubscriptionRecord) -> EntitlementSet {
    let def = TierDefinition::for_tier(record.tier);

    EntitlementSet {
        max_transactions: def.max_transactions,
        max_reports: def.max_reports,
        max_users: def.max_users,
        can_export_data: def.features.can_export_data,
        has_advanced_analytics: def.features.has_advanced_analytics,
        // Program enrollment grants access regardless of platform tier
        has_accelerator_access: def.features.has_accelerator_access
            || record.accelerator_access.grants_access(),
        has_phone_support: def.features.has_phone_support,
        has_custom_branding: def.features.has_custom_branding,
    }
}

pub fn lifecycle_state(record: &SubscriptionRecord) -> LifecycleState {
    if !record.tier.is_paid() {
        LifecycleState::Starter
    } else if record.cancel_at_period_end {
        LifecycleState::Canceling
    } else {
        LifecycleState::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accrue_shared::{AcceleratorAccess, SubscriptionTier};
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn record(tier: SubscriptionTier) -> SubscriptionRecord {
        SubscriptionRecord {
            tier,
            ..SubscriptionRecord::new_default(Uuid::new_v4(), OffsetDateTime::now_utc())
        }
    }

    #[test]
    fn test_resolve_starter() {
        let set = resolve(&record(SubscriptionTier::Starter));
        assert_eq!(set.max_transactions, Limit::Limited(20));
        assert_eq!(set.limit_for(ResourceType::Reports), Limit::Limited(1));
        assert!(!set.has_accelerator_access);
    }

    #[test]
    fn test_resolve_growth() {
        let set = resolve(&record(SubscriptionTier::Growth));
        assert_eq!(set.max_transactions, Limit::Limited(500));
        assert!(set.can_export_data);
        assert!(!set.has_custom_branding);
    }

    #[test]
    fn test_accelerator_enrollment_grants_access_on_any_tier() {
        for access in [AcceleratorAccess::Enrolled, AcceleratorAccess::Completed] {
            let rec = SubscriptionRecord {
                accelerator_access: access,
                ..record(SubscriptionTier::Starter)
            };
            assert!(resolve(&rec).has_accelerator_access);
        }
    }

    #[test]
    fn test_accelerate_tier_grants_access_without_enrollment() {
        assert!(resolve(&record(SubscriptionTier::Accelerate)).has_accelerator_access);
    }

    #[test]
    fn test_lifecycle_state() {
        assert_eq!(lifecycle_state(&record(SubscriptionTier::Starter)), LifecycleState::Starter);
        assert_eq!(lifecycle_state(&record(SubscriptionTier::Growth)), LifecycleState::Active);

        let canceling = SubscriptionRecord {
            cancel_at_period_end: true,
            ..record(SubscriptionTier::Accelerate)
        };
        assert_eq!(lifecycle_state(&canceling), LifecycleState::Canceling);
    }
}
