//! Common types used across Accrue

use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// Enums
// =============================================================================

/// Subscription tier for billing
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    /// No paid plan
    #[default]
    Starter,
    Growth,
    Accelerate,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starter => "starter",
            Self::Growth => "growth",
            Self::Accelerate => "accelerate",
        }
    }

    pub fn is_paid(&self) -> bool {
        !matches!(self, Self::Starter)
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accelerator program enrollment, independent of the platform tier
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AcceleratorAccess {
    #[default]
    None,
    Enrolled,
    Completed,
}

impl AcceleratorAccess {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Enrolled => "enrolled",
            Self::Completed => "completed",
        }
    }

    /// Enrolled and completed participants both keep accelerator features
    pub fn grants_access(&self) -> bool {
        matches!(self, Self::Enrolled | Self::Completed)
    }
}

impl fmt::Display for AcceleratorAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metered resource kinds with per-period quotas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Transactions,
    Reports,
    TeamSeats,
}

impl ResourceType {
    pub const ALL: [ResourceType; 3] = [Self::Transactions, Self::Reports, Self::TeamSeats];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transactions => "transactions",
            Self::Reports => "reports",
            Self::TeamSeats => "team_seats",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
