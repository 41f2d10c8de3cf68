//! API server configuration

use std::time::Duration;

use accrue_billing::BillingOptions;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000,http://127.0.0.1:3000";
const DEFAULT_CACHE_TTL_SECS: u64 = 30;
const DEFAULT_WEBHOOK_TIMEOUT_SECS: u64 = 8;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} is invalid: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub enable_billing: bool,
    pub entitlement_cache_ttl: Duration,
    pub webhook_timeout: Duration,
    /// Bearer token for internal RPC routes; those routes refuse requests when unset
    pub internal_api_token: Option<String>,
    pub allowed_origins: Vec<String>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("enable_billing", &self.enable_billing)
            .field("entitlement_cache_ttl", &self.entitlement_cache_ttl)
            .field("webhook_timeout", &self.webhook_timeout)
            .field("internal_api_token", &self.internal_api_token.as_ref().map(|_| "[REDACTED]"))
            .field("allowed_origins", &self.allowed_origins)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let bind_address = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string());

        let enable_billing = std::env::var("ENABLE_BILLING")
            .map(|v| !v.trim().eq_ignore_ascii_case("false"))
            .unwrap_or(true);

        let entitlement_cache_ttl =
            Duration::from_secs(parse_secs("ENTITLEMENT_CACHE_TTL_SECS", DEFAULT_CACHE_TTL_SECS)?);

        let webhook_timeout = Duration::from_secs(parse_secs("WEBHOOK_TIMEOUT_SECS", DEFAULT_WEBHOOK_TIMEOUT_SECS)?);
        if webhook_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                name: "WEBHOOK_TIMEOUT_SECS",
                value: "0".to_string(),
            });
        }

        let internal_api_token = std::env::var("INTERNAL_API_TOKEN")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| DEFAULT_ALLOWED_ORIGINS.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            database_url,
            bind_address,
            enable_billing,
            entitlement_cache_ttl,
            webhook_timeout,
            internal_api_token,
            allowed_origins,
        })
    }

    pub fn billing_options(&self) -> BillingOptions {
        BillingOptions {
            cache_ttl: self.entitlement_cache_ttl,
            webhook_deadline: self.webhook_timeout,
        }
    }
}

fn parse_secs(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { name, value }),
        Err(_) => Ok(default),
    }
}
