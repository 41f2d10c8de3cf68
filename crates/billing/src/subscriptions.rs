//! Subscription management
//!
//! The only writer of `SubscriptionRecord`s. Every write is a version-checked
//! compare-and-swap; a lost race is retried from a fresh read a bounded number
//! of times and then surfaced as the transient `ConflictRetriesExhausted`. A
//! caller-pinned version that no longer matches is a plain `VersionConflict`.

use std::sync::Arc;

use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::cache::EntitlementCache;
use crate::client::DEFAULT_INSTALLMENT_PAYMENT_COUNT;
use crate::error::{BillingError, BillingResult};
use crate::mutations::{MutationContext, MutationEffects, MutationOutcome, SubscriptionMutation};
use crate::store::{SubscriptionRecord, SubscriptionStore};

/// Attempts per mutation when the caller did not pin a version
pub const MAX_WRITE_ATTEMPTS: usize = 3;

/// Result of `apply_event`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMutation {
    /// Record as stored after the call
    pub record: SubscriptionRecord,
    /// False when the mutation was a no-op and nothing was written
    pub changed: bool,
    pub effects: MutationEffects,
}

pub struct SubscriptionService {
    store: Arc<dyn SubscriptionStore>,
    cache: Arc<EntitlementCache>,
    installment_payment_count: u32,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn SubscriptionStore>, cache: Arc<EntitlementCache>) -> Self {
        Self {
            store,
            cache,
            installment_payment_count: DEFAULT_INSTALLMENT_PAYMENT_COUNT,
        }
    }

    pub fn with_installment_payment_count(mut self, count: u32) -> Self {
        self.installment_payment_count = count;
        self
    }

    pub fn installment_payment_count(&self) -> u32 {
        self.installment_payment_count
    }

    pub fn store(&self) -> &Arc<dyn SubscriptionStore> {
        &self.store
    }

    pub async fn get(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        self.store.get_subscription(user_id).await
    }

    /// Read the user's record, creating the starter default on first access
    pub async fn get_or_create(&self, user_id: Uuid) -> BillingResult<SubscriptionRecord> {
        if let Some(record) = self.store.get_subscription(user_id).await? {
            return Ok(record);
        }

        let record = self
            .store
            .create_subscription_if_absent(&SubscriptionRecord::new_default(user_id, OffsetDateTime::now_utc()))
            .await?;

        tracing::info!(user_id = %user_id, tier = %record.tier, "Created subscription record");
        Ok(record)
    }

    /// Apply a mutation under optimistic concurrency.
    ///
    /// With `expected_version` the write only happens against that version and a
    /// mismatch is returned immediately. Without it, conflicts are retried from a
    /// fresh read up to `MAX_WRITE_ATTEMPTS` times.
    pub async fn apply_event(
        &self,
        user_id: Uuid,
        mutation: &SubscriptionMutation,
        expected_version: Option<i64>,
    ) -> BillingResult<AppliedMutation> {
        let strategy = ExponentialBackoff::from_millis(10)
            .map(jitter)
            .take(MAX_WRITE_ATTEMPTS - 1);

        let result = RetryIf::spawn(
            strategy,
            move || self.try_apply(user_id, mutation, expected_version),
            |e: &BillingError| {
                expected_version.is_none() && matches!(e, BillingError::VersionConflict { .. })
            },
        )
        .await;

        match result {
            Err(BillingError::VersionConflict { expected, actual, .. }) if expected_version.is_none() => {
                tracing::warn!(
                    user_id = %user_id,
                    mutation = mutation.name(),
                    expected = expected,
                    actual = actual,
                    attempts = MAX_WRITE_ATTEMPTS,
                    "Subscription write lost the version race on every attempt"
                );
                Err(BillingError::ConflictRetriesExhausted {
                    user_id: user_id.to_string(),
                    attempts: MAX_WRITE_ATTEMPTS,
                })
            }
            other => other,
        }
    }

    async fn try_apply(
        &self,
        user_id: Uuid,
        mutation: &SubscriptionMutation,
        expected_version: Option<i64>,
    ) -> BillingResult<AppliedMutation> {
        let current = self.get_or_create(user_id).await?;

        if let Some(expected) = expected_version {
            if current.version != expected {
                return Err(BillingError::VersionConflict {
                    user_id: user_id.to_string(),
                    expected,
                    actual: current.version,
                });
            }
        }

        let ctx = MutationContext {
            now: OffsetDateTime::now_utc(),
            installment_payment_count: self.installment_payment_count,
        };

        let (mut record, effects) = match mutation.apply(&current, &ctx)? {
            MutationOutcome::Unchanged => {
                tracing::debug!(
                    user_id = %user_id,
                    mutation = mutation.name(),
                    version = current.version,
                    "Mutation is a no-op"
                );
                return Ok(AppliedMutation {
                    record: current,
                    changed: false,
                    effects: MutationEffects::default(),
                });
            }
            MutationOutcome::Changed { record, effects } => (record, effects),
        };

        record.version = current.version + 1;

        if !self
            .store
            .compare_and_swap_subscription(&record, current.version)
            .await?
        {
            let actual = self
                .store
                .get_subscription(user_id)
                .await?
                .map(|r| r.version)
                .unwrap_or(current.version);

            tracing::debug!(
                user_id = %user_id,
                mutation = mutation.name(),
                expected = current.version,
                actual = actual,
                "Version conflict, retrying from a fresh read"
            );

            return Err(BillingError::VersionConflict {
                user_id: user_id.to_string(),
                expected: current.version,
                actual,
            });
        }

        self.cache.invalidate(user_id);

        tracing::info!(
            user_id = %user_id,
            mutation = mutation.name(),
            tier = %record.tier,
            version = record.version,
            cancel_at_period_end = record.cancel_at_period_end,
            "Subscription record updated"
        );

        Ok(AppliedMutation {
            record,
            changed: true,
            effects,
        })
    }
}
