//! Tier catalog
//!
//! Static mapping from subscription tier to quota limits and feature flags.
//! Pure data; nothing here touches storage.

use accrue_shared::{ResourceType, SubscriptionTier};
use serde::{Deserialize, Serialize};

/// A quota limit. Serialized as a number, or `null` when unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Limit {
    Limited(i64),
    Unbounded,
}

impl Limit {
    /// Whether `current + amount` stays within this limit
    pub fn allows(&self, current: i64, amount: i64) -> bool {
        match self {
            Limit::Unbounded => true,
            Limit::Limited(max) => current.checked_add(amount).is_some_and(|total| total <= *max),
        }
    }

    /// Headroom left; `None` when unbounded
    pub fn remaining(&self, current: i64) -> Option<i64> {
        match self {
            Limit::Unbounded => None,
            Limit::Limited(max) => Some(max.saturating_sub(current).max(0)),
        }
    }

    pub fn as_option(&self) -> Option<i64> {
        match self {
            Limit::Unbounded => None,
            Limit::Limited(max) => Some(*max),
        }
    }
}

/// Feature flags granted by a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierFeatures {
    pub can_export_data: bool,
    pub has_advanced_analytics: bool,
    pub has_accelerator_access: bool,
    pub has_phone_support: bool,
    pub has_custom_branding: bool,
}

/// Limits and features for one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierDefinition {
    pub tier: SubscriptionTier,
    pub max_transactions: Limit,
    pub max_reports: Limit,
    pub max_users: Limit,
    pub features: TierFeatures,
}

/// Starter: 20 transactions, 1 report, 1 seat
const STARTER: TierDefinition = TierDefinition {
    tier: SubscriptionTier::Starter,
    max_transactions: Limit::Limited(20),
    max_reports: Limit::Limited(1),
    max_users: Limit::Limited(1),
    features: TierFeatures {
        can_export_data: false,
        has_advanced_analytics: false,
        has_accelerator_access: false,
        has_phone_support: false,
        has_custom_branding: false,
    },
};

/// Growth: 500 transactions, 10 reports, 3 seats
const GROWTH: TierDefinition = TierDefinition {
    tier: SubscriptionTier::Growth,
    max_transactions: Limit::Limited(500),
    max_reports: Limit::Limited(10),
    max_users: Limit::Limited(3),
    features: TierFeatures {
        can_export_data: true,
        has_advanced_analytics: true,
        has_accelerator_access: false,
        has_phone_support: false,
        has_custom_branding: false,
    },
};

/// Accelerate: unlimited transactions and reports, 10 seats
const ACCELERATE: TierDefinition = TierDefinition {
    tier: SubscriptionTier::Accelerate,
    max_transactions: Limit::Unbounded,
    max_reports: Limit::Unbounded,
    max_users: Limit::Limited(10),
    features: TierFeatures {
        can_export_data: true,
        has_advanced_analytics: true,
        has_accelerator_access: true,
        has_phone_support: true,
        has_custom_branding: true,
    },
};

impl TierDefinition {
    pub fn for_tier(tier: SubscriptionTier) -> &'static TierDefinition {
        match tier {
            SubscriptionTier::Starter => &STARTER,
            SubscriptionTier::Growth => &GROWTH,
            SubscriptionTier::Accelerate => &ACCELERATE,
        }
    }

    pub fn limit_for(&self, resource: ResourceType) -> Limit {
        match resource {
            ResourceType::Transactions => self.max_transactions,
            ResourceType::Reports => self.max_reports,
            ResourceType::TeamSeats => self.max_users,
        }
    }
}
