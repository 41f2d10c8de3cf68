//! Typed subscription mutations
//!
//! Every change to a `SubscriptionRecord` is one of these commands. Each maps to
//! a fixed set of field writes and reports `Unchanged` when applying it would
//! not alter the record, in which case nothing is written and the version does
//! not move.

use accrue_shared::{AcceleratorAccess, SubscriptionTier};
use time::OffsetDateTime;

use crate::client::StripeConfig;
use crate::error::{BillingError, BillingResult};
use crate::provider::ProviderSubscription;
use crate::store::SubscriptionRecord;

/// Provider-reported subscription state, already mapped to a tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub tier: SubscriptionTier,
    pub customer_id: String,
    pub subscription_id: String,
    pub period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

impl SubscriptionSnapshot {
    /// Map a provider subscription onto a tier via the configured price ids
    pub fn from_provider(sub: &ProviderSubscription, config: &StripeConfig) -> BillingResult<Self> {
        let price_id = sub.price_id.as_deref().unwrap_or_default();
        let tier = config
            .tier_for_price_id(price_id)
            .ok_or_else(|| BillingError::InvalidTier(format!("Unknown price ID '{}'", price_id)))?;

        Ok(Self {
            tier,
            customer_id: sub.customer_id.clone(),
            subscription_id: sub.id.clone(),
            period_end: sub
                .current_period_end
                .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok()),
            cancel_at_period_end: sub.cancel_at_period_end,
        })
    }

    /// A completed installment plan stays set to cancel regardless of what the
    /// provider reports; a different subscription starts a fresh plan.
    fn write_into(&self, record: &mut SubscriptionRecord, ctx: &MutationContext) {
        if record.provider_subscription_id.as_deref() != Some(self.subscription_id.as_str()) {
            record.installment_payments = 0;
        }
        record.tier = self.tier;
        record.provider_customer_id = Some(self.customer_id.clone());
        record.provider_subscription_id = Some(self.subscription_id.clone());
        record.period_end = self.period_end;
        record.cancel_at_period_end = self.cancel_at_period_end
            || record.installment_plan_complete(ctx.installment_payment_count);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionMutation {
    /// Link the user to the provider customer (and subscription, when known)
    CheckoutCompleted {
        customer_id: String,
        subscription_id: Option<String>,
    },
    /// Subscription created or updated at the provider
    TierChanged(SubscriptionSnapshot),
    /// Subscription deleted; ignored unless it is the record's current subscription
    SubscriptionEnded { subscription_id: String },
    PaymentRecorded {
        amount_cents: i64,
        paid_at: OffsetDateTime,
        installment_plan: bool,
    },
    PaymentFailed { failed_at: OffsetDateTime },
    CancellationRequested { period_end: Option<OffsetDateTime> },
    CancellationReverted,
    /// Administrative update outside the provider flow
    AdminOverride {
        tier: Option<SubscriptionTier>,
        accelerator_access: Option<AcceleratorAccess>,
    },
    /// Authoritative state pulled by the reconciler; ignored for a superseded subscription
    ProviderSync(SubscriptionSnapshot),
}

/// Inputs a mutation needs beyond the record itself
#[derive(Debug, Clone, Copy)]
pub struct MutationContext {
    pub now: OffsetDateTime,
    pub installment_payment_count: u32,
}

/// Follow-up work the caller must perform after the write commits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutationEffects {
    /// This payment completed an installment plan; cancel at period end at the provider
    pub installment_completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    Unchanged,
    /// New record contents; version and `last_updated` are set by the service
    Changed {
        record: SubscriptionRecord,
        effects: MutationEffects,
    },
}

impl SubscriptionMutation {
    pub fn name(&self) -> &'static str {
        match self {
            SubscriptionMutation::CheckoutCompleted { .. } => "checkout_completed",
            SubscriptionMutation::TierChanged(_) => "tier_changed",
            SubscriptionMutation::SubscriptionEnded { .. } => "subscription_ended",
            SubscriptionMutation::PaymentRecorded { .. } => "payment_recorded",
            SubscriptionMutation::PaymentFailed { .. } => "payment_failed",
            SubscriptionMutation::CancellationRequested { .. } => "cancellation_requested",
            SubscriptionMutation::CancellationReverted => "cancellation_reverted",
            SubscriptionMutation::AdminOverride { .. } => "admin_override",
            SubscriptionMutation::ProviderSync(_) => "provider_sync",
        }
    }

    /// Compute the new record. Pure; never touches storage.
    pub fn apply(
        &self,
        current: &SubscriptionRecord,
        ctx: &MutationContext,
    ) -> BillingResult<MutationOutcome> {
        let mut next = current.clone();
        let mut effects = MutationEffects::default();

        match self {
            SubscriptionMutation::CheckoutCompleted {
                customer_id,
                subscription_id,
            } => {
                if customer_id.trim().is_empty() {
                    return Err(BillingError::InvalidInput(
                        "provider customer id is required".to_string(),
                    ));
                }
                next.provider_customer_id = Some(customer_id.clone());
                if let Some(subscription_id) = subscription_id {
                    next.provider_subscription_id = Some(subscription_id.clone());
                }
            }

            SubscriptionMutation::TierChanged(snapshot) => snapshot.write_into(&mut next, ctx),

            SubscriptionMutation::SubscriptionEnded { subscription_id } => {
                if current.provider_subscription_id.as_deref() != Some(subscription_id.as_str()) {
                    return Ok(MutationOutcome::Unchanged);
                }
                // accelerator_access is independent of the platform tier
                next.tier = SubscriptionTier::Starter;
                next.provider_subscription_id = None;
                next.cancel_at_period_end = false;
                next.period_end = None;
                next.installment_payments = 0;
            }

            SubscriptionMutation::PaymentRecorded {
                amount_cents,
                paid_at,
                installment_plan,
            } => {
                if *amount_cents < 0 {
                    return Err(BillingError::InvalidInput(format!(
                        "payment amount must not be negative, got {}",
                        amount_cents
                    )));
                }
                next.total_paid_cents = current.total_paid_cents.saturating_add(*amount_cents);
                next.last_payment_at = Some(*paid_at);
                next.payment_failed_at = None;

                if *installment_plan && *amount_cents > 0 {
                    next.installment_payments = current.installment_payments.saturating_add(1);
                    let target = i32::try_from(ctx.installment_payment_count).unwrap_or(i32::MAX);
                    if next.installment_payments == target {
                        next.cancel_at_period_end = true;
                        effects.installment_completed = true;
                    }
                }
            }

            SubscriptionMutation::PaymentFailed { failed_at } => {
                next.payment_failed_at = Some(*failed_at);
            }

            SubscriptionMutation::CancellationRequested { period_end } => {
                if current.provider_subscription_id.is_none() {
                    return Err(BillingError::SubscriptionNotFound(current.user_id.to_string()));
                }
                next.cancel_at_period_end = true;
                if period_end.is_some() {
                    next.period_end = *period_end;
                }
            }

            SubscriptionMutation::CancellationReverted => {
                if current.installment_plan_complete(ctx.installment_payment_count) {
                    return Err(BillingError::InvalidInput(
                        "installment plan is paid in full; the subscription ends at period end"
                            .to_string(),
                    ));
                }
                next.cancel_at_period_end = false;
            }

            SubscriptionMutation::AdminOverride {
                tier,
                accelerator_access,
            } => {
                if tier.is_none() && accelerator_access.is_none() {
                    return Err(BillingError::InvalidInput(
                        "nothing to update: provide tier or accelerator_access".to_string(),
                    ));
                }
                if let Some(tier) = tier {
                    next.tier = *tier;
                }
                if let Some(access) = accelerator_access {
                    next.accelerator_access = *access;
                }
            }

            SubscriptionMutation::ProviderSync(snapshot) => {
                if current.provider_subscription_id.as_deref() != Some(snapshot.subscription_id.as_str()) {
                    return Ok(MutationOutcome::Unchanged);
                }
                snapshot.write_into(&mut next, ctx);
            }
        }

        if next == *current {
            return Ok(MutationOutcome::Unchanged);
        }

        next.last_updated = ctx.now;
        Ok(MutationOutcome::Changed {
            record: next,
            effects,
        })
    }
}
