//! Payment provider access
//!
//! Everything that talks to the provider API goes through `ProviderClient`, so
//! the webhook path, the sync gateway and the reconciler can run against a fake
//! in tests.

use async_trait::async_trait;
use stripe::{Subscription, SubscriptionId, UpdateSubscription};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::events::{SubscriptionObject, SubscriptionStatus};

/// Provider-side view of one subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSubscription {
    pub id: String,
    pub customer_id: String,
    pub status: SubscriptionStatus,
    pub price_id: Option<String>,
    pub cancel_at_period_end: bool,
    /// Unix seconds
    pub current_period_end: Option<i64>,
}

impl From<&SubscriptionObject> for ProviderSubscription {
    fn from(sub: &SubscriptionObject) -> Self {
        Self {
            id: sub.id.clone(),
            customer_id: sub.customer.id().to_string(),
            status: sub.status,
            price_id: sub.price_id().map(str::to_string),
            cancel_at_period_end: sub.cancel_at_period_end,
            current_period_end: sub.period_end(),
        }
    }
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// `Ok(None)` when the provider no longer knows the subscription
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<ProviderSubscription>>;

    /// Schedule (`true`) or revert (`false`) cancellation at period end
    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<ProviderSubscription>;
}

/// `ProviderClient` backed by async-stripe
#[derive(Clone)]
pub struct StripeProviderClient {
    stripe: StripeClient,
}

impl StripeProviderClient {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    fn parse_id(subscription_id: &str) -> BillingResult<SubscriptionId> {
        subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid subscription ID: {}", e)))
    }
}

fn from_stripe(sub: &Subscription) -> ProviderSubscription {
    let item = sub.items.data.first();

    ProviderSubscription {
        id: sub.id.to_string(),
        customer_id: sub.customer.id().to_string(),
        status: SubscriptionStatus::from(sub.status.as_str()),
        price_id: item.and_then(|i| i.price.as_ref()).map(|p| p.id.to_string()),
        cancel_at_period_end: sub.cancel_at_period_end,
        current_period_end: Some(sub.current_period_end),
    }
}

fn is_not_found(e: &stripe::StripeError) -> bool {
    matches!(e, stripe::StripeError::Stripe(req) if req.http_status == 404)
}

#[async_trait]
impl ProviderClient for StripeProviderClient {
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<ProviderSubscription>> {
        let id = Self::parse_id(subscription_id)?;

        match Subscription::retrieve(self.stripe.inner(), &id, &[]).await {
            Ok(sub) => Ok(Some(from_stripe(&sub))),
            Err(e) if is_not_found(&e) => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    "Subscription not found at provider"
                );
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<ProviderSubscription> {
        let id = Self::parse_id(subscription_id)?;

        let params = UpdateSubscription {
            cancel_at_period_end: Some(cancel),
            ..Default::default()
        };

        let sub = Subscription::update(self.stripe.inner(), &id, params).await?;

        tracing::info!(
            subscription_id = %subscription_id,
            cancel_at_period_end = cancel,
            "Updated provider cancellation schedule"
        );

        Ok(from_stripe(&sub))
    }
}
