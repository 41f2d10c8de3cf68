//! Billing Invariants Module
//!
//! Runnable consistency checks over the entitlement tables. They can be run
//! after a webhook replay or a reconciliation pass to confirm the system is in
//! a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Rows stuck in `processing` longer than this are reported
const STUCK_PROCESSING_MINUTES: i32 = 15;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Users affected (empty for event-level checks)
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Quota or entitlement is being granted incorrectly
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(checked_at: OffsetDateTime, checks_run: usize, violations: Vec<InvariantViolation>) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaidWithoutSubscriptionRow {
    user_id: Uuid,
    tier: String,
    provider_customer_id: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct CancelingNoPeriodEndRow {
    user_id: Uuid,
    tier: String,
    provider_subscription_id: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct FailedEventRow {
    provider_event_id: String,
    event_type: String,
    retryable: bool,
    error_message: Option<String>,
    received_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckEventRow {
    provider_event_id: String,
    event_type: String,
    received_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct CounterOverLimitRow {
    user_id: Uuid,
    resource_type: String,
    period_key: String,
    current: i64,
    limit_value: i64,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_paid_tier_has_subscription().await?);
        violations.extend(self.check_canceling_has_period_end().await?);
        violations.extend(self.check_no_failed_events().await?);
        violations.extend(self.check_no_stuck_events().await?);
        violations.extend(self.check_usage_within_limit().await?);

        let summary = InvariantCheckSummary::from_violations(now, Self::available_checks().len(), violations);

        for violation in summary.violations.iter().filter(|v| {
            matches!(v.severity, ViolationSeverity::Critical | ViolationSeverity::High)
        }) {
            tracing::error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                user_ids = ?violation.user_ids,
                "RECONCILIATION NEEDED: {}",
                violation.description
            );
        }

        Ok(summary)
    }

    /// Invariant 1: Paid tiers are backed by a provider subscription
    ///
    /// Admin overrides can legitimately produce this, hence Medium.
    async fn check_paid_tier_has_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PaidWithoutSubscriptionRow> = sqlx::query_as(
            r#"
            SELECT user_id, tier, provider_customer_id
            FROM subscription_records
            WHERE tier IN ('growth', 'accelerate')
              AND provider_subscription_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_tier_has_subscription".to_string(),
                user_ids: vec![row.user_id],
                description: format!("User on tier '{}' has no provider subscription", row.tier),
                context: serde_json::json!({
                    "tier": row.tier,
                    "has_customer": row.provider_customer_id.is_some(),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 2: A scheduled cancellation knows when access ends
    async fn check_canceling_has_period_end(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CancelingNoPeriodEndRow> = sqlx::query_as(
            r#"
            SELECT user_id, tier, provider_subscription_id
            FROM subscription_records
            WHERE cancel_at_period_end = TRUE
              AND period_end IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "canceling_has_period_end".to_string(),
                user_ids: vec![row.user_id],
                description: "Subscription is canceling but has no period_end date".to_string(),
                context: serde_json::json!({
                    "tier": row.tier,
                    "provider_subscription_id": row.provider_subscription_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: No processed event is left failed
    ///
    /// Permanent failures may have partially applied effects.
    async fn check_no_failed_events(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<FailedEventRow> = sqlx::query_as(
            r#"
            SELECT provider_event_id, event_type, retryable, error_message, received_at
            FROM processed_events
            WHERE outcome = 'failed'
            ORDER BY received_at DESC
            LIMIT 500
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_failed_events".to_string(),
                user_ids: vec![],
                description: format!(
                    "Event {} ({}) failed: {}",
                    row.provider_event_id,
                    row.event_type,
                    row.error_message.as_deref().unwrap_or("(no message)")
                ),
                context: serde_json::json!({
                    "provider_event_id": row.provider_event_id,
                    "event_type": row.event_type,
                    "retryable": row.retryable,
                    "received_at": row.received_at.unix_timestamp(),
                }),
                severity: if row.retryable {
                    ViolationSeverity::Medium
                } else {
                    ViolationSeverity::High
                },
            })
            .collect())
    }

    /// Invariant 4: No event stays claimed without an outcome
    async fn check_no_stuck_events(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckEventRow> = sqlx::query_as(
            r#"
            SELECT provider_event_id, event_type, received_at
            FROM processed_events
            WHERE outcome = 'processing'
              AND claimed_at < NOW() - make_interval(mins => $1)
            ORDER BY claimed_at ASC
            LIMIT 500
            "#,
        )
        .bind(STUCK_PROCESSING_MINUTES)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stuck_events".to_string(),
                user_ids: vec![],
                description: format!(
                    "Event {} ({}) has been processing for more than {} minutes",
                    row.provider_event_id, row.event_type, STUCK_PROCESSING_MINUTES
                ),
                context: serde_json::json!({
                    "provider_event_id": row.provider_event_id,
                    "event_type": row.event_type,
                    "received_at": row.received_at.unix_timestamp(),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: Counters never exceed the limit they were incremented under
    ///
    /// A downgrade lowers the effective limit without touching `limit_value`,
    /// so this only fires on a real overrun.
    async fn check_usage_within_limit(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CounterOverLimitRow> = sqlx::query_as(
            r#"
            SELECT user_id, resource_type, period_key, current, limit_value
            FROM usage_counters
            WHERE limit_value IS NOT NULL
              AND current > limit_value
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "usage_within_limit".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "{} usage for {} is {} (limit {})",
                    row.resource_type, row.period_key, row.current, row.limit_value
                ),
                context: serde_json::json!({
                    "resource_type": row.resource_type,
                    "period_key": row.period_key,
                    "current": row.current,
                    "limit_value": row.limit_value,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "paid_tier_has_subscription",
            "canceling_has_period_end",
            "no_failed_events",
            "no_stuck_events",
            "usage_within_limit",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(invariant: &str, severity: ViolationSeverity) -> InvariantViolation {
        InvariantViolation {
            invariant: invariant.to_string(),
            user_ids: vec![Uuid::new_v4()],
            description: "test".to_string(),
            context: serde_json::json!({}),
            severity,
        }
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 5);
        assert!(checks.contains(&"usage_within_limit"));
        assert!(checks.contains(&"no_failed_events"));
    }

    #[test]
    fn test_summary_counts_failed_checks_not_violations() {
        let summary = InvariantCheckSummary::from_violations(
            OffsetDateTime::now_utc(),
            5,
            vec![
                violation("no_failed_events", ViolationSeverity::High),
                violation("no_failed_events", ViolationSeverity::Medium),
                violation("usage_within_limit", ViolationSeverity::Critical),
            ],
        );

        assert_eq!(summary.checks_failed, 2);
        assert_eq!(summary.checks_passed, 3);
        assert!(!summary.healthy);
    }

    #[test]
    fn test_empty_summary_is_healthy() {
        let summary = InvariantCheckSummary::from_violations(OffsetDateTime::now_utc(), 5, vec![]);
        assert!(summary.healthy);
        assert_eq!(summary.checks_passed, 5);
    }
}
