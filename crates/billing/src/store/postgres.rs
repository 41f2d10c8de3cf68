//! PostgreSQL store

use accrue_shared::ResourceType;
use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    ClaimResult, EventOutcome, IncrementOutcome, ProcessedEvent, ProcessedEventStore,
    SubscriptionRecord, SubscriptionStore, UsageCounter, UsageStore,
};
use crate::error::{BillingError, BillingResult};
use crate::tiers::Limit;

const SUBSCRIPTION_COLUMNS: &str = r#"
    user_id, tier, provider_customer_id, provider_subscription_id,
    cancel_at_period_end, period_end, accelerator_access, total_paid_cents,
    installment_payments, last_payment_at, payment_failed_at, version,
    created_at, last_updated
"#;

const EVENT_COLUMNS: &str = r#"
    provider_event_id, event_type, received_at, claimed_at, outcome, retryable,
    error_message, completed_at
"#;

/// Unique violation on the customer index means the customer belongs to someone else
fn map_write_error(e: sqlx::Error) -> BillingError {
    if let Some(db) = e.as_database_error() {
        if db.code().as_deref() == Some("23505") {
            return BillingError::InvalidInput(format!(
                "provider customer already linked to another user ({})",
                db.constraint().unwrap_or("unique")
            ));
        }
    }
    BillingError::Database(e.to_string())
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn get_subscription(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        let record: Option<SubscriptionRecord> = sqlx::query_as(&format!(
            "SELECT {} FROM subscription_records WHERE user_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn create_subscription_if_absent(
        &self,
        record: &SubscriptionRecord,
    ) -> BillingResult<SubscriptionRecord> {
        sqlx::query(
            r#"
            INSERT INTO subscription_records (
                user_id, tier, accelerator_access, total_paid_cents,
                installment_payments, cancel_at_period_end, version,
                created_at, last_updated
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(record.user_id)
        .bind(record.tier)
        .bind(record.accelerator_access)
        .bind(record.total_paid_cents)
        .bind(record.installment_payments)
        .bind(record.cancel_at_period_end)
        .bind(record.version)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        self.get_subscription(record.user_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(record.user_id.to_string()))
    }

    async fn compare_and_swap_subscription(
        &self,
        record: &SubscriptionRecord,
        expected_version: i64,
    ) -> BillingResult<bool> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE subscription_records SET
                tier = $3,
                provider_customer_id = $4,
                provider_subscription_id = $5,
                cancel_at_period_end = $6,
                period_end = $7,
                accelerator_access = $8,
                total_paid_cents = $9,
                installment_payments = $10,
                last_payment_at = $11,
                payment_failed_at = $12,
                version = $13,
                last_updated = $14
            WHERE user_id = $1 AND version = $2
            "#,
        )
        .bind(record.user_id)
        .bind(expected_version)
        .bind(record.tier)
        .bind(&record.provider_customer_id)
        .bind(&record.provider_subscription_id)
        .bind(record.cancel_at_period_end)
        .bind(record.period_end)
        .bind(record.accelerator_access)
        .bind(record.total_paid_cents)
        .bind(record.installment_payments)
        .bind(record.last_payment_at)
        .bind(record.payment_failed_at)
        .bind(record.version)
        .bind(record.last_updated)
        .execute(&self.pool)
        .await
        .map_err(map_write_error)?
        .rows_affected();

        Ok(rows_affected == 1)
    }

    async fn find_user_by_customer(&self, customer_id: &str) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            "SELECT user_id FROM subscription_records WHERE provider_customer_id = $1",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id,)| id))
    }

    async fn list_provider_linked(
        &self,
        after: Option<Uuid>,
        limit: i64,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let records: Vec<SubscriptionRecord> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM subscription_records
            WHERE provider_subscription_id IS NOT NULL
              AND ($1::uuid IS NULL OR user_id > $1)
            ORDER BY user_id ASC
            LIMIT $2
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}

#[async_trait]
impl ProcessedEventStore for PgStore {
    async fn try_claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        received_at: OffsetDateTime,
    ) -> BillingResult<ClaimResult> {
        // Only one concurrent delivery gets a row back
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO processed_events (provider_event_id, event_type, received_at, claimed_at, outcome)
            VALUES ($1, $2, $3, $3, 'processing')
            ON CONFLICT (provider_event_id) DO NOTHING
            RETURNING provider_event_id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(received_at)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(ClaimResult::Claimed);
        }

        let existing = self.get_event(event_id).await?.ok_or_else(|| {
            BillingError::Internal(format!("processed event {} vanished after conflict", event_id))
        })?;

        Ok(ClaimResult::Exists(existing))
    }

    async fn reclaim_event(
        &self,
        event_id: &str,
        now: OffsetDateTime,
        stale_before: OffsetDateTime,
    ) -> BillingResult<bool> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE processed_events
            SET outcome = 'processing', claimed_at = $2, error_message = NULL, completed_at = NULL
            WHERE provider_event_id = $1
              AND ((outcome = 'failed' AND retryable)
                   OR (outcome = 'processing' AND claimed_at < $3))
            "#,
        )
        .bind(event_id)
        .bind(now)
        .bind(stale_before)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected == 1)
    }

    async fn record_outcome(
        &self,
        event_id: &str,
        outcome: EventOutcome,
        error_message: Option<&str>,
        retryable: bool,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE processed_events
            SET outcome = $2, error_message = $3, retryable = $4, completed_at = NOW()
            WHERE provider_event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(outcome)
        .bind(error_message)
        .bind(retryable)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_event(&self, event_id: &str) -> BillingResult<Option<ProcessedEvent>> {
        let event: Option<ProcessedEvent> = sqlx::query_as(&format!(
            "SELECT {} FROM processed_events WHERE provider_event_id = $1",
            EVENT_COLUMNS
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(event)
    }

    async fn list_events(
        &self,
        outcome: Option<EventOutcome>,
        limit: i64,
    ) -> BillingResult<Vec<ProcessedEvent>> {
        let events: Vec<ProcessedEvent> = match outcome {
            Some(outcome) => {
                sqlx::query_as(&format!(
                    r#"
                    SELECT {} FROM processed_events
                    WHERE outcome = $1
                    ORDER BY received_at DESC
                    LIMIT $2
                    "#,
                    EVENT_COLUMNS
                ))
                .bind(outcome)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    r#"
                    SELECT {} FROM processed_events
                    ORDER BY received_at DESC
                    LIMIT $1
                    "#,
                    EVENT_COLUMNS
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(events)
    }
}

#[async_trait]
impl UsageStore for PgStore {
    async fn try_increment(
        &self,
        user_id: Uuid,
        resource: ResourceType,
        period_key: &str,
        amount: i64,
        limit: Limit,
    ) -> BillingResult<IncrementOutcome> {
        let limit_value = limit.as_option();

        // Lazily create the counter for this period
        sqlx::query(
            r#"
            INSERT INTO usage_counters (user_id, resource_type, period_key, current, limit_value)
            VALUES ($1, $2, $3, 0, $4)
            ON CONFLICT (user_id, resource_type, period_key) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(resource)
        .bind(period_key)
        .bind(limit_value)
        .execute(&self.pool)
        .await?;

        // The limit check happens inside the UPDATE so concurrent callers serialize on the row
        let accepted: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE usage_counters
            SET current = current + $4, limit_value = $5, updated_at = NOW()
            WHERE user_id = $1 AND resource_type = $2 AND period_key = $3
              AND ($5::BIGINT IS NULL OR current + $4 <= $5)
            RETURNING current
            "#,
        )
        .bind(user_id)
        .bind(resource)
        .bind(period_key)
        .bind(amount)
        .bind(limit_value)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((current,)) = accepted {
            return Ok(IncrementOutcome::Accepted { current });
        }

        let current = self
            .get_counter(user_id, resource, period_key)
            .await?
            .map(|c| c.current)
            .unwrap_or(0);

        Ok(IncrementOutcome::Rejected { current })
    }

    async fn get_counter(
        &self,
        user_id: Uuid,
        resource: ResourceType,
        period_key: &str,
    ) -> BillingResult<Option<UsageCounter>> {
        let counter: Option<UsageCounter> = sqlx::query_as(
            r#"
            SELECT user_id, resource_type, period_key, current, limit_value, updated_at
            FROM usage_counters
            WHERE user_id = $1 AND resource_type = $2 AND period_key = $3
            "#,
        )
        .bind(user_id)
        .bind(resource)
        .bind(period_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(counter)
    }
}
