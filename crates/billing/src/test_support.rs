//! Shared fixtures for the crate's tests: a fake provider, a fully wired
//! in-memory `BillingService` and builders for provider events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::{PriceIds, StripeConfig};
use crate::error::{BillingError, BillingResult};
use crate::events::{EventData, EventEnvelope, ProviderEvent, SubscriptionStatus};
use crate::mutations::{SubscriptionMutation, SubscriptionSnapshot};
use crate::provider::{ProviderClient, ProviderSubscription};
use crate::reconcile::Reconciler;
use crate::store::InMemoryStore;
use crate::{BillingOptions, BillingService};

pub const GROWTH_PRICE: &str = "price_growth_monthly";
pub const ACCELERATE_PRICE: &str = "price_accelerate_monthly";
pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

/// Fixed period end used by every fixture subscription
pub const PERIOD_END: i64 = 1_900_000_000;

pub fn config() -> StripeConfig {
    StripeConfig {
        secret_key: Some("sk_test_fake".to_string()),
        webhook_secret: Some(WEBHOOK_SECRET.to_string()),
        price_ids: PriceIds {
            growth_monthly: GROWTH_PRICE.to_string(),
            growth_annual: "price_growth_annual".to_string(),
            accelerate_monthly: ACCELERATE_PRICE.to_string(),
            accelerate_annual: "price_accelerate_annual".to_string(),
        },
        ..StripeConfig::default()
    }
}

// =============================================================================
// Fake provider
// =============================================================================

#[derive(Default)]
pub struct FakeProvider {
    subscriptions: Mutex<HashMap<String, ProviderSubscription>>,
    cancel_calls: Mutex<Vec<(String, bool)>>,
    fail_next: AtomicBool,
}

impl FakeProvider {
    pub fn put_subscription(&self, sub: ProviderSubscription) {
        self.subscriptions.lock().unwrap().insert(sub.id.clone(), sub);
    }

    pub fn remove_subscription(&self, subscription_id: &str) {
        self.subscriptions.lock().unwrap().remove(subscription_id);
    }

    pub fn cancel_calls(&self) -> Vec<(String, bool)> {
        self.cancel_calls.lock().unwrap().clone()
    }

    /// Make the next provider call fail with a transient error
    pub fn fail_next_call(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    fn check_failure(&self) -> BillingResult<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(BillingError::StripeApi("simulated provider outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ProviderClient for FakeProvider {
    async fn retrieve_subscription(&self, subscription_id: &str) -> BillingResult<Option<ProviderSubscription>> {
        self.check_failure()?;
        Ok(self.subscriptions.lock().unwrap().get(subscription_id).cloned())
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<ProviderSubscription> {
        self.check_failure()?;
        self.cancel_calls
            .lock()
            .unwrap()
            .push((subscription_id.to_string(), cancel));

        let mut subs = self.subscriptions.lock().unwrap();
        let sub = subs
            .entry(subscription_id.to_string())
            .or_insert_with(|| ProviderSubscription {
                id: subscription_id.to_string(),
                customer_id: "cus_unknown".to_string(),
                status: SubscriptionStatus::Active,
                price_id: Some(GROWTH_PRICE.to_string()),
                cancel_at_period_end: false,
                current_period_end: Some(PERIOD_END),
            });
        sub.cancel_at_period_end = cancel;
        Ok(sub.clone())
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub billing: BillingService,
    pub store: InMemoryStore,
    pub provider: Arc<FakeProvider>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(true)
    }

    /// No provider API credential configured
    pub fn without_provider() -> Self {
        Self::build(false)
    }

    fn build(with_provider: bool) -> Self {
        let store = InMemoryStore::new();
        let provider = Arc::new(FakeProvider::default());
        let client: Option<Arc<dyn ProviderClient>> = if with_provider {
            Some(provider.clone())
        } else {
            None
        };

        let billing = BillingService::with_store(store.clone(), config(), client, BillingOptions::default());
        Self {
            billing,
            store,
            provider,
        }
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.billing.subscriptions.clone(), self.provider.clone(), config())
    }

    /// Link `user_id` to a provider customer, as checkout completion does
    pub async fn link(&self, user_id: Uuid, customer_id: &str) {
        self.billing
            .subscriptions
            .apply_event(
                user_id,
                &SubscriptionMutation::CheckoutCompleted {
                    customer_id: customer_id.to_string(),
                    subscription_id: None,
                },
                None,
            )
            .await
            .unwrap();
    }

    /// Link the user and put them on an active subscription for `price_id`
    pub async fn subscribe(&self, user_id: Uuid, customer_id: &str, subscription_id: &str, price_id: &str) {
        self.link(user_id, customer_id).await;

        let remote = ProviderSubscription {
            id: subscription_id.to_string(),
            customer_id: customer_id.to_string(),
            status: SubscriptionStatus::Active,
            price_id: Some(price_id.to_string()),
            cancel_at_period_end: false,
            current_period_end: Some(PERIOD_END),
        };
        let snapshot = SubscriptionSnapshot::from_provider(&remote, &config()).unwrap();
        self.provider.put_subscription(remote);

        self.billing
            .subscriptions
            .apply_event(user_id, &SubscriptionMutation::TierChanged(snapshot), None)
            .await
            .unwrap();
    }
}

// =============================================================================
// Event builders
// =============================================================================

pub fn event(id: &str, event_type: &str, object: serde_json::Value) -> ProviderEvent {
    ProviderEvent::from_envelope(EventEnvelope {
        id: id.to_string(),
        event_type: event_type.to_string(),
        created: OffsetDateTime::now_utc().unix_timestamp(),
        data: EventData { object },
    })
    .unwrap()
}

pub fn checkout_completed(id: &str, user_id: Uuid, customer_id: &str, subscription_id: Option<&str>) -> ProviderEvent {
    event(
        id,
        "checkout.session.completed",
        json!({
            "id": format!("cs_{}", id),
            "object": "checkout.session",
            "customer": customer_id,
            "subscription": subscription_id,
            "client_reference_id": user_id.to_string(),
            "metadata": {}
        }),
    )
}

pub fn subscription_event(
    id: &str,
    event_type: &str,
    subscription_id: &str,
    customer_id: &str,
    status: &str,
    price_id: &str,
) -> ProviderEvent {
    event(
        id,
        event_type,
        json!({
            "id": subscription_id,
            "object": "subscription",
            "customer": customer_id,
            "status": status,
            "cancel_at_period_end": false,
            "current_period_end": PERIOD_END,
            "items": {
                "object": "list",
                "data": [{ "price": { "id": price_id }, "current_period_end": PERIOD_END }]
            },
            "metadata": {}
        }),
    )
}

pub fn invoice_event(
    id: &str,
    event_type: &str,
    customer_id: &str,
    subscription_id: &str,
    amount_paid: i64,
    installment_plan: bool,
) -> ProviderEvent {
    let metadata = if installment_plan {
        json!({ "installment_plan": "true" })
    } else {
        json!({})
    };

    event(
        id,
        event_type,
        json!({
            "id": format!("in_{}", id),
            "object": "invoice",
            "customer": customer_id,
            "subscription": subscription_id,
            "amount_paid": amount_paid,
            "metadata": metadata
        }),
    )
}
