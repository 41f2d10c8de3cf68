//! Reconciliation pull
//!
//! Webhooks can arrive out of order or not at all. This job walks every record
//! linked to a provider subscription, asks the provider for the current state
//! and writes it back through a `ProviderSync` (or `SubscriptionEnded`)
//! mutation. The provider is the source of truth, with one exception: a
//! record whose installment plan is paid in full stays set to cancel, and the
//! provider is told again if it lost that flag.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::client::StripeConfig;
use crate::error::{BillingError, BillingResult};
use crate::mutations::{SubscriptionMutation, SubscriptionSnapshot};
use crate::provider::ProviderClient;
use crate::store::SubscriptionRecord;
use crate::subscriptions::SubscriptionService;

/// Records fetched per page; a run walks every page
pub const DEFAULT_RECONCILE_BATCH: i64 = 1_000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub checked: usize,
    pub updated: usize,
    pub ended: usize,
    pub unchanged: usize,
    /// Provider state we could not map (unknown price, unexpected status)
    pub needs_attention: usize,
    /// Completed installment plans re-sent to the provider as cancel-at-period-end
    pub provider_repaired: usize,
    pub errors: usize,
}

enum Action {
    Updated,
    Ended,
    Unchanged,
    NeedsAttention,
    ProviderRepaired,
}

pub struct Reconciler {
    subscriptions: Arc<SubscriptionService>,
    provider: Arc<dyn ProviderClient>,
    config: StripeConfig,
    batch_size: i64,
}

impl Reconciler {
    pub fn new(
        subscriptions: Arc<SubscriptionService>,
        provider: Arc<dyn ProviderClient>,
        config: StripeConfig,
    ) -> Self {
        Self {
            subscriptions,
            provider,
            config,
            batch_size: DEFAULT_RECONCILE_BATCH,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Pull provider state for every linked record. Per-record failures are
    /// counted and logged; the run continues.
    pub async fn reconcile_all(&self) -> BillingResult<ReconcileSummary> {
        tracing::info!(batch_size = self.batch_size, "Starting subscription reconciliation");

        let mut summary = ReconcileSummary::default();
        let mut cursor: Option<Uuid> = None;

        loop {
            let page = self
                .subscriptions
                .store()
                .list_provider_linked(cursor, self.batch_size)
                .await?;

            for record in &page {
                summary.checked += 1;
                match self.reconcile_one(record).await {
                    Ok(Action::Updated) => summary.updated += 1,
                    Ok(Action::Ended) => summary.ended += 1,
                    Ok(Action::Unchanged) => summary.unchanged += 1,
                    Ok(Action::NeedsAttention) => summary.needs_attention += 1,
                    Ok(Action::ProviderRepaired) => summary.provider_repaired += 1,
                    Err(e) => {
                        summary.errors += 1;
                        tracing::warn!(
                            user_id = %record.user_id,
                            error = %e,
                            "Failed to reconcile subscription"
                        );
                    }
                }
            }

            let full_page = i64::try_from(page.len()).unwrap_or(i64::MAX) >= self.batch_size;
            match page.last() {
                Some(last) if full_page => cursor = Some(last.user_id),
                _ => break,
            }
        }

        tracing::info!(
            checked = summary.checked,
            updated = summary.updated,
            ended = summary.ended,
            needs_attention = summary.needs_attention,
            provider_repaired = summary.provider_repaired,
            errors = summary.errors,
            "Subscription reconciliation complete"
        );

        Ok(summary)
    }

    async fn reconcile_one(&self, record: &SubscriptionRecord) -> BillingResult<Action> {
        let Some(subscription_id) = record.provider_subscription_id.as_deref() else {
            return Ok(Action::Unchanged);
        };

        let remote = self.provider.retrieve_subscription(subscription_id).await?;

        let remote_cancels = remote.as_ref().is_some_and(|r| r.cancel_at_period_end);
        let mutation = match remote {
            None => SubscriptionMutation::SubscriptionEnded {
                subscription_id: subscription_id.to_string(),
            },
            Some(remote) if remote.status.is_ended() => SubscriptionMutation::SubscriptionEnded {
                subscription_id: remote.id.clone(),
            },
            Some(remote) if remote.status.grants_tier() => {
                match SubscriptionSnapshot::from_provider(&remote, &self.config) {
                    Ok(snapshot) => SubscriptionMutation::ProviderSync(snapshot),
                    Err(BillingError::InvalidTier(reason)) => {
                        self.log_attention(record.user_id, subscription_id, &reason);
                        return Ok(Action::NeedsAttention);
                    }
                    Err(e) => return Err(e),
                }
            }
            Some(remote) => {
                self.log_attention(
                    record.user_id,
                    subscription_id,
                    &format!("provider status {:?} grants no tier", remote.status),
                );
                return Ok(Action::NeedsAttention);
            }
        };

        let ends = matches!(mutation, SubscriptionMutation::SubscriptionEnded { .. });
        let applied = self
            .subscriptions
            .apply_event(record.user_id, &mutation, None)
            .await?;

        if !ends
            && !remote_cancels
            && applied
                .record
                .installment_plan_complete(self.subscriptions.installment_payment_count())
        {
            self.provider
                .set_cancel_at_period_end(subscription_id, true)
                .await?;
            tracing::warn!(
                user_id = %record.user_id,
                subscription_id = %subscription_id,
                installment_payments = applied.record.installment_payments,
                "Re-sent cancel at period end for completed installment plan"
            );
            return Ok(Action::ProviderRepaired);
        }

        Ok(match (applied.changed, ends) {
            (false, _) => Action::Unchanged,
            (true, true) => Action::Ended,
            (true, false) => Action::Updated,
        })
    }

    fn log_attention(&self, user_id: Uuid, subscription_id: &str, reason: &str) {
        tracing::error!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            reason = %reason,
            "RECONCILIATION NEEDED: provider state cannot be mapped"
        );
    }
}
