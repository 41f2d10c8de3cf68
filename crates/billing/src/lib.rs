// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries provider error text
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Accrue Billing Module
//!
//! Subscription entitlements backed by Stripe.
//!
//! ## Features
//!
//! - **Webhooks**: Verify, deduplicate and apply Stripe events exactly once
//! - **Subscription Store**: Version-checked writes through typed mutations
//! - **Entitlements**: Pure tier -> feature/quota resolution, with a read-through cache
//! - **Usage Ledger**: Atomic check-and-increment of per-period quotas
//! - **Sync Gateway**: Reads and commands for checkout, portal and UI clients
//! - **Reconciliation**: Periodic pull of provider state
//! - **Invariants**: Read-only consistency checks

pub mod cache;
pub mod client;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod invariants;
pub mod mutations;
pub mod provider;
pub mod reconcile;
pub mod store;
pub mod subscriptions;
pub mod sync;
pub mod tiers;
pub mod usage;
pub mod verify;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;
#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;
use std::time::Duration;

// Cache
pub use cache::{CachedEntitlement, EntitlementCache, DEFAULT_CACHE_TTL};

// Client
pub use client::{PriceIds, StripeClient, StripeConfig};

// Entitlement
pub use entitlement::{lifecycle_state, resolve, EntitlementSet, LifecycleState};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{EventKind, EventPayload, ProviderEvent};

// Idempotency
pub use idempotency::{Admission, EventDeduplicator};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Mutations
pub use mutations::{SubscriptionMutation, SubscriptionSnapshot};

// Provider
pub use provider::{ProviderClient, ProviderSubscription, StripeProviderClient};

// Reconciliation
pub use reconcile::{ReconcileSummary, Reconciler};

// Store
pub use store::{
    EventOutcome, InMemoryStore, PgStore, ProcessedEvent, ProcessedEventStore, SubscriptionRecord,
    SubscriptionStore, UsageStore,
};

// Subscriptions
pub use subscriptions::{AppliedMutation, SubscriptionService};

// Sync
pub use sync::{EntitlementView, SubscriptionUpdate, SubscriptionView, SyncGateway};

// Tiers
pub use tiers::{Limit, TierDefinition};

// Usage
pub use usage::{PeriodKey, UsageDecision, UsageLedger, UsageSnapshot};

// Verification
pub use verify::{VerificationError, WebhookVerifier, SIGNATURE_HEADER};

// Webhooks
pub use webhooks::{WebhookHandler, WebhookOutcome, DEFAULT_WEBHOOK_DEADLINE};

use sqlx::PgPool;

/// Tunables that are not part of the Stripe configuration
#[derive(Debug, Clone, Copy)]
pub struct BillingOptions {
    pub cache_ttl: Duration,
    pub webhook_deadline: Duration,
}

impl Default for BillingOptions {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
            webhook_deadline: DEFAULT_WEBHOOK_DEADLINE,
        }
    }
}

/// Main billing service that wires the components together over one store
pub struct BillingService {
    pub config: StripeConfig,
    pub cache: Arc<EntitlementCache>,
    pub subscriptions: Arc<SubscriptionService>,
    pub usage: Arc<UsageLedger>,
    pub events: Arc<EventDeduplicator>,
    pub webhooks: Arc<WebhookHandler>,
    pub sync: Arc<SyncGateway>,
    /// `None` without a provider API credential
    pub reconciler: Option<Arc<Reconciler>>,
}

impl BillingService {
    /// Create a Postgres-backed billing service from environment variables
    pub fn from_env(pool: PgPool, options: BillingOptions) -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;

        let provider: Option<Arc<dyn ProviderClient>> = match StripeClient::new(&config) {
            Ok(stripe) => Some(Arc::new(StripeProviderClient::new(stripe))),
            Err(e) => {
                tracing::debug!(error = %e, "No provider client; cancellation and reconciliation disabled");
                None
            }
        };

        Ok(Self::with_store(PgStore::new(pool), config, provider, options))
    }

    /// Build the service over any store implementing all three storage traits
    pub fn with_store<S>(
        store: S,
        config: StripeConfig,
        provider: Option<Arc<dyn ProviderClient>>,
        options: BillingOptions,
    ) -> Self
    where
        S: SubscriptionStore + ProcessedEventStore + UsageStore + Clone + 'static,
    {
        let cache = Arc::new(EntitlementCache::new(options.cache_ttl));

        let subscriptions = Arc::new(
            SubscriptionService::new(Arc::new(store.clone()), cache.clone())
                .with_installment_payment_count(config.installment_payment_count),
        );
        let usage = Arc::new(UsageLedger::new(Arc::new(store.clone()), subscriptions.clone()));
        let events = Arc::new(EventDeduplicator::new(Arc::new(store)).with_lease(options.webhook_deadline));

        let webhooks = Arc::new(
            WebhookHandler::new(
                config.clone(),
                events.clone(),
                subscriptions.clone(),
                provider.clone(),
            )
            .with_deadline(options.webhook_deadline),
        );

        let sync = Arc::new(SyncGateway::new(
            subscriptions.clone(),
            usage.clone(),
            cache.clone(),
            provider.clone(),
        ));

        let reconciler = provider.map(|provider| {
            Arc::new(Reconciler::new(subscriptions.clone(), provider, config.clone()))
        });

        Self {
            config,
            cache,
            subscriptions,
            usage,
            events,
            webhooks,
            sync,
            reconciler,
        }
    }
}
