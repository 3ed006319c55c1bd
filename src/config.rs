use alloy_primitives::{address, Address};
use serde::Deserialize;

use crate::models::TokenDomain;
use crate::notification::WebhookTargets;
use crate::retry::RetryPolicy;

/// USDC on Base mainnet.
const DEFAULT_TOKEN_ADDRESS: Address = address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913");

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub port: u16,
    /// Unset runs on the in-memory store.
    pub database_url: Option<String>,
    /// Merchant key for creating and submitting requests. Unset disables the check.
    pub api_key: Option<String>,
    pub relay_url: String,
    pub relay_api_key: String,
    pub chain_id: u64,
    pub token_address: Address,
    pub token_name: String,
    pub token_version: String,
    /// Comma-separated list of webhook URLs to notify on status changes.
    pub webhook_urls: Vec<String>,
    pub webhook_secret: Option<String>,
    /// PIN draws before creation gives up. Set via PINPAY_PIN_ATTEMPTS. Default: 10.
    pub pin_attempts: u32,
    pub relay_max_attempts: u32,
    pub relay_base_delay_ms: u64,
    pub submission_lease_secs: i64,
    pub sweep_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            database_url: None,
            api_key: None,
            relay_url: "https://api.gelato.digital".into(),
            relay_api_key: String::new(),
            chain_id: 8453,
            token_address: DEFAULT_TOKEN_ADDRESS,
            token_name: "USD Coin".into(),
            token_version: "2".into(),
            webhook_urls: Vec::new(),
            webhook_secret: None,
            pin_attempts: 10,
            relay_max_attempts: 3,
            relay_base_delay_ms: 2_000,
            submission_lease_secs: 120,
            sweep_interval_secs: 30,
        }
    }
}

impl Config {
    pub fn token_domain(&self) -> TokenDomain {
        TokenDomain {
            name: self.token_name.clone(),
            version: self.token_version.clone(),
            chain_id: self.chain_id,
            verifying_contract: self.token_address,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.relay_max_attempts,
            base_delay_ms: self.relay_base_delay_ms,
            ..RetryPolicy::default()
        }
    }

    pub fn webhook_targets(&self) -> WebhookTargets {
        WebhookTargets {
            urls: self.webhook_urls.clone(),
            secret: self.webhook_secret.clone(),
        }
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();
    from_lookup(|key| std::env::var(key).ok())
}

/// Build a config from any variable source; `load` passes the process environment.
pub fn from_lookup<F>(var: F) -> anyhow::Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = Config::default();

    let api_key = var("PINPAY_API_KEY").filter(|k| !k.is_empty());
    if api_key.is_none() {
        let env_mode = var("PINPAY_ENV")
            .or_else(|| var("RUST_ENV"))
            .unwrap_or_default();
        if env_mode == "production" {
            anyhow::bail!(
                "PINPAY_API_KEY is not set. \
                 Set a merchant key before running in production."
            );
        }
        eprintln!("⚠️  PINPAY_API_KEY is not set, merchant endpoints are unauthenticated.");
    }

    let token_address = match var("PINPAY_TOKEN_ADDRESS") {
        Some(raw) => raw
            .trim()
            .parse::<Address>()
            .map_err(|e| anyhow::anyhow!("PINPAY_TOKEN_ADDRESS is not an address: {}", e))?,
        None => defaults.token_address,
    };

    Ok(Config {
        port: parsed(&var, "PINPAY_PORT").unwrap_or(defaults.port),
        database_url: var("DATABASE_URL").filter(|u| !u.is_empty()),
        api_key,
        relay_url: var("PINPAY_RELAY_URL").unwrap_or(defaults.relay_url),
        relay_api_key: var("PINPAY_RELAY_API_KEY").unwrap_or_default(),
        chain_id: parsed(&var, "PINPAY_CHAIN_ID").unwrap_or(defaults.chain_id),
        token_address,
        token_name: var("PINPAY_TOKEN_NAME").unwrap_or(defaults.token_name),
        token_version: var("PINPAY_TOKEN_VERSION").unwrap_or(defaults.token_version),
        webhook_urls: var("PINPAY_WEBHOOK_URLS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        webhook_secret: var("PINPAY_WEBHOOK_SECRET").filter(|s| !s.is_empty()),
        pin_attempts: parsed(&var, "PINPAY_PIN_ATTEMPTS").unwrap_or(defaults.pin_attempts),
        relay_max_attempts: parsed(&var, "PINPAY_RELAY_MAX_ATTEMPTS")
            .unwrap_or(defaults.relay_max_attempts),
        relay_base_delay_ms: parsed(&var, "PINPAY_RELAY_BASE_DELAY_MS")
            .unwrap_or(defaults.relay_base_delay_ms),
        submission_lease_secs: parsed(&var, "PINPAY_SUBMISSION_LEASE_SECS")
            .unwrap_or(defaults.submission_lease_secs),
        sweep_interval_secs: parsed(&var, "PINPAY_SWEEP_INTERVAL_SECS")
            .unwrap_or(defaults.sweep_interval_secs),
    })
}

fn parsed<T, F>(var: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    var(key).and_then(|v| v.trim().parse().ok())
}
