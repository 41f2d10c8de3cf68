//! Sync gateway
//!
//! The boundary used by checkout completion, the billing portal and UI
//! clients. It reads reconciled state and forwards commands to the
//! subscription service; it owns no state of its own. Provider identifiers
//! never leave this module.

use std::sync::Arc;

use accrue_shared::{AcceleratorAccess, SubscriptionTier};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::{CachedEntitlement, EntitlementCache};
use crate::entitlement::{lifecycle_state, resolve, EntitlementSet, LifecycleState};
use crate::error::{BillingError, BillingResult};
use crate::mutations::SubscriptionMutation;
use crate::provider::ProviderClient;
use crate::store::SubscriptionRecord;
use crate::subscriptions::SubscriptionService;
use crate::usage::{PeriodKey, UsageLedger, UsageSnapshot};

/// Subscription state safe to hand to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionView {
    pub tier: SubscriptionTier,
    pub state: LifecycleState,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_end: Option<OffsetDateTime>,
    pub accelerator_access: AcceleratorAccess,
    pub total_paid_cents: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_payment_at: Option<OffsetDateTime>,
    /// Latest invoice failed and no payment has succeeded since
    pub payment_issue: bool,
    pub has_billing_account: bool,
    pub version: i64,
}

impl From<&SubscriptionRecord> for SubscriptionView {
    fn from(record: &SubscriptionRecord) -> Self {
        Self {
            tier: record.tier,
            state: lifecycle_state(record),
            cancel_at_period_end: record.cancel_at_period_end,
            period_end: record.period_end,
            accelerator_access: record.accelerator_access,
            total_paid_cents: record.total_paid_cents,
            last_payment_at: record.last_payment_at,
            payment_issue: record.payment_failed_at.is_some(),
            has_billing_account: record.provider_customer_id.is_some(),
            version: record.version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntitlementView {
    pub subscription: SubscriptionView,
    pub entitlement: EntitlementSet,
    pub usage: Vec<UsageSnapshot>,
}

/// Administrative update request
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubscriptionUpdate {
    #[serde(default)]
    pub tier: Option<SubscriptionTier>,
    #[serde(default)]
    pub accelerator_access: Option<AcceleratorAccess>,
    #[serde(default)]
    pub expected_version: Option<i64>,
}

pub struct SyncGateway {
    subscriptions: Arc<SubscriptionService>,
    ledger: Arc<UsageLedger>,
    cache: Arc<EntitlementCache>,
    provider: Option<Arc<dyn ProviderClient>>,
}

impl SyncGateway {
    pub fn new(
        subscriptions: Arc<SubscriptionService>,
        ledger: Arc<UsageLedger>,
        cache: Arc<EntitlementCache>,
        provider: Option<Arc<dyn ProviderClient>>,
    ) -> Self {
        Self {
            subscriptions,
            ledger,
            cache,
            provider,
        }
    }

    /// Subscription, resolved entitlement and this period's usage
    pub async fn get_entitlement(&self, user_id: Uuid) -> BillingResult<EntitlementView> {
        let cached = self
            .cache
            .get_or_load(user_id, move || async move {
                let record = self.subscriptions.get_or_create(user_id).await?;
                Ok(CachedEntitlement {
                    entitlement: resolve(&record),
                    record,
                })
            })
            .await?;

        // Usage is always read live
        let usage = self
            .ledger
            .summary(user_id, &cached.entitlement, &PeriodKey::current())
            .await?;

        Ok(EntitlementView {
            subscription: SubscriptionView::from(&cached.record),
            entitlement: cached.entitlement,
            usage,
        })
    }

    /// Link the user to their provider customer. A repeat call is a no-op.
    pub async fn record_checkout_completed(
        &self,
        user_id: Uuid,
        provider_customer_id: &str,
    ) -> BillingResult<SubscriptionView> {
        let mutation = SubscriptionMutation::CheckoutCompleted {
            customer_id: provider_customer_id.trim().to_string(),
            subscription_id: None,
        };
        let applied = self.subscriptions.apply_event(user_id, &mutation, None).await?;

        tracing::info!(
            user_id = %user_id,
            changed = applied.changed,
            version = applied.record.version,
            "Checkout completion recorded"
        );

        Ok(SubscriptionView::from(&applied.record))
    }

    /// Schedule cancellation at period end, at the provider first
    pub async fn cancel_subscription(&self, user_id: Uuid) -> BillingResult<SubscriptionView> {
        let (provider, _record, subscription_id) = self.provider_and_subscription(user_id).await?;

        let remote = provider.set_cancel_at_period_end(&subscription_id, true).await?;
        let period_end = remote
            .current_period_end
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok());

        let applied = self
            .subscriptions
            .apply_event(
                user_id,
                &SubscriptionMutation::CancellationRequested { period_end },
                None,
            )
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            "Cancelled subscription at period end"
        );

        Ok(SubscriptionView::from(&applied.record))
    }

    /// Revert a scheduled cancellation
    pub async fn resume_subscription(&self, user_id: Uuid) -> BillingResult<SubscriptionView> {
        let (provider, record, subscription_id) = self.provider_and_subscription(user_id).await?;

        if record.installment_plan_complete(self.subscriptions.installment_payment_count()) {
            return Err(BillingError::InvalidInput(
                "installment plan is paid in full; the subscription ends at period end".to_string(),
            ));
        }

        provider.set_cancel_at_period_end(&subscription_id, false).await?;

        let applied = self
            .subscriptions
            .apply_event(user_id, &SubscriptionMutation::CancellationReverted, None)
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            "Resumed subscription"
        );

        Ok(SubscriptionView::from(&applied.record))
    }

    /// Administrative tier/accelerator update, optionally pinned to a version
    pub async fn update_user_subscription(
        &self,
        user_id: Uuid,
        update: SubscriptionUpdate,
    ) -> BillingResult<SubscriptionView> {
        let mutation = SubscriptionMutation::AdminOverride {
            tier: update.tier,
            accelerator_access: update.accelerator_access,
        };
        let applied = self
            .subscriptions
            .apply_event(user_id, &mutation, update.expected_version)
            .await?;

        tracing::info!(
            user_id = %user_id,
            tier = %applied.record.tier,
            accelerator_access = %applied.record.accelerator_access,
            changed = applied.changed,
            "Admin subscription update"
        );

        Ok(SubscriptionView::from(&applied.record))
    }

    async fn provider_and_subscription(
        &self,
        user_id: Uuid,
    ) -> BillingResult<(&Arc<dyn ProviderClient>, SubscriptionRecord, String)> {
        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| BillingError::Config("STRIPE_SECRET_KEY not configured".to_string()))?;

        let record = self.subscriptions.get_or_create(user_id).await?;
        let subscription_id = record
            .provider_subscription_id
            .clone()
            .ok_or_else(|| BillingError::SubscriptionNotFound(user_id.to_string()))?;

        Ok((provider, record, subscription_id))
    }
}
