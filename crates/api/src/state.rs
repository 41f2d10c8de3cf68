//! Application state

use std::sync::Arc;

use accrue_billing::BillingService;
use sqlx::PgPool;

use crate::config::Config;
use crate::error::{ApiError, ApiResult};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// `None` when billing is disabled or failed to configure
    pub billing: Option<Arc<BillingService>>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let billing = if config.enable_billing {
            match BillingService::from_env(pool, config.billing_options()) {
                Ok(service) => {
                    tracing::info!("Billing service initialized");
                    Some(Arc::new(service))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Billing service not configured");
                    None
                }
            }
        } else {
            tracing::info!("Billing disabled by ENABLE_BILLING=false");
            None
        };

        Self {
            config: Arc::new(config),
            billing,
        }
    }

    pub fn with_billing(config: Config, billing: BillingService) -> Self {
        Self {
            config: Arc::new(config),
            billing: Some(Arc::new(billing)),
        }
    }

    pub fn billing(&self) -> ApiResult<&Arc<BillingService>> {
        self.billing
            .as_ref()
            .ok_or_else(|| ApiError::Config("Billing not configured".to_string()))
    }
}
