//! Stripe configuration and client wrapper

use accrue_shared::SubscriptionTier;

use crate::error::{BillingError, BillingResult};

/// Default number of successful invoices that completes an installment plan
pub const DEFAULT_INSTALLMENT_PAYMENT_COUNT: u32 = 3;

/// Default replay tolerance for webhook signatures
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;

/// Stripe price IDs for each paid tier
#[derive(Debug, Clone, Default)]
pub struct PriceIds {
    pub growth_monthly: String,
    pub growth_annual: String,
    pub accelerate_monthly: String,
    pub accelerate_annual: String,
}

impl PriceIds {
    pub fn from_env() -> Self {
        Self {
            growth_monthly: env_or_empty("STRIPE_PRICE_GROWTH_MONTHLY"),
            growth_annual: env_or_empty("STRIPE_PRICE_GROWTH_ANNUAL"),
            accelerate_monthly: env_or_empty("STRIPE_PRICE_ACCELERATE_MONTHLY"),
            accelerate_annual: env_or_empty("STRIPE_PRICE_ACCELERATE_ANNUAL"),
        }
    }
}

/// Billing configuration loaded from the environment.
///
/// Both secrets are optional so the service can start and report a clear
/// configuration error instead of refusing to boot.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Provider API credential (`STRIPE_SECRET_KEY`)
    pub secret_key: Option<String>,
    /// Shared webhook signing secret (`STRIPE_WEBHOOK_SECRET`)
    pub webhook_secret: Option<String>,
    pub price_ids: PriceIds,
    /// Successful payments that complete an installment plan
    pub installment_payment_count: u32,
    pub webhook_tolerance_secs: i64,
}

impl Default for StripeConfig {
    fn default() -> Self {
        Self {
            secret_key: None,
            webhook_secret: None,
            price_ids: PriceIds::default(),
            installment_payment_count: DEFAULT_INSTALLMENT_PAYMENT_COUNT,
            webhook_tolerance_secs: DEFAULT_WEBHOOK_TOLERANCE_SECS,
        }
    }
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let installment_payment_count = match std::env::var("INSTALLMENT_PAYMENT_COUNT") {
            Ok(v) => v.parse::<u32>().ok().filter(|n| *n > 0).ok_or_else(|| {
                BillingError::Config(format!("INSTALLMENT_PAYMENT_COUNT must be a positive integer, got '{}'", v))
            })?,
            Err(_) => DEFAULT_INSTALLMENT_PAYMENT_COUNT,
        };

        let webhook_tolerance_secs = match std::env::var("WEBHOOK_TOLERANCE_SECS") {
            Ok(v) => v.parse::<i64>().ok().filter(|n| *n > 0).ok_or_else(|| {
                BillingError::Config(format!("WEBHOOK_TOLERANCE_SECS must be a positive integer, got '{}'", v))
            })?,
            Err(_) => DEFAULT_WEBHOOK_TOLERANCE_SECS,
        };

        let config = Self {
            secret_key: env_non_empty("STRIPE_SECRET_KEY"),
            webhook_secret: env_non_empty("STRIPE_WEBHOOK_SECRET"),
            price_ids: PriceIds::from_env(),
            installment_payment_count,
            webhook_tolerance_secs,
        };

        if config.secret_key.is_none() {
            tracing::warn!("STRIPE_SECRET_KEY not set - provider calls and reconciliation disabled");
        }
        if config.webhook_secret.is_none() {
            tracing::warn!("STRIPE_WEBHOOK_SECRET not set - webhooks will be rejected");
        }

        Ok(config)
    }

    /// Map a Stripe price ID to the tier it purchases
    pub fn tier_for_price_id(&self, price_id: &str) -> Option<SubscriptionTier> {
        if price_id.is_empty() {
            return None;
        }
        let ids = &self.price_ids;
        if price_id == ids.growth_monthly || price_id == ids.growth_annual {
            Some(SubscriptionTier::Growth)
        } else if price_id == ids.accelerate_monthly || price_id == ids.accelerate_annual {
            Some(SubscriptionTier::Accelerate)
        } else {
            None
        }
    }
}

/// Thin wrapper over the async-stripe client
#[derive(Clone)]
pub struct StripeClient {
    client: stripe::Client,
}

impl StripeClient {
    /// Build a client; fails when no API credential is configured
    pub fn new(config: &StripeConfig) -> BillingResult<Self> {
        let secret_key = config
            .secret_key
            .clone()
            .ok_or_else(|| BillingError::Config("STRIPE_SECRET_KEY not configured".to_string()))?;

        Ok(Self {
            client: stripe::Client::new(secret_key),
        })
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.client
    }
}

fn env_or_empty(key: &str) -> String {
    std::env::var(key).unwrap_or_default()
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
