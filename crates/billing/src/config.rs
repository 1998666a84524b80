//! Billing configuration loaded from the environment

use std::time::Duration;

use crate::error::{BillingError, BillingResult};

const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_IDEMPOTENCY_TTL_HOURS: u64 = 24;
const DEFAULT_LEDGER_SWEEP_INTERVAL_SECS: u64 = 300;
const DEFAULT_LOCK_EVICTION_INTERVAL_SECS: u64 = 600;

/// Census size always allowed for new processes, even past the process limit
pub const DEFAULT_TEST_CENSUS_ALLOWANCE: i64 = 10;

/// Stripe credentials and call policy
#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Maximum age of a signed webhook, in seconds
    pub webhook_tolerance_secs: i64,
    /// Upper bound for every outbound Stripe call
    pub request_timeout: Duration,
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("secret_key", &"[redacted]")
            .field("webhook_secret", &"[redacted]")
            .field("webhook_tolerance_secs", &self.webhook_tolerance_secs)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl StripeConfig {
    pub fn new(secret_key: impl Into<String>, webhook_secret: impl Into<String>) -> Self {
        Self {
            secret_key: secret_key.into(),
            webhook_secret: webhook_secret.into(),
            webhook_tolerance_secs: DEFAULT_WEBHOOK_TOLERANCE_SECS,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        let secret_key = required_var("STRIPE_SECRET_KEY")?;
        let webhook_secret = required_var("STRIPE_WEBHOOK_SECRET")?;

        Ok(Self {
            secret_key,
            webhook_secret,
            webhook_tolerance_secs: parse_var(
                "STRIPE_WEBHOOK_TOLERANCE_SECS",
                DEFAULT_WEBHOOK_TOLERANCE_SECS,
            )?,
            request_timeout: Duration::from_secs(parse_var(
                "STRIPE_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )?),
        })
    }
}

/// Everything the billing core needs besides its collaborators
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub stripe: StripeConfig,
    /// How long processed event ids are remembered
    pub idempotency_ttl: Duration,
    pub ledger_sweep_interval: Duration,
    pub lock_eviction_interval: Duration,
    pub test_census_allowance: i64,
}

impl BillingConfig {
    pub fn new(stripe: StripeConfig) -> Self {
        Self {
            stripe,
            idempotency_ttl: Duration::from_secs(DEFAULT_IDEMPOTENCY_TTL_HOURS * 3600),
            ledger_sweep_interval: Duration::from_secs(DEFAULT_LEDGER_SWEEP_INTERVAL_SECS),
            lock_eviction_interval: Duration::from_secs(DEFAULT_LOCK_EVICTION_INTERVAL_SECS),
            test_census_allowance: DEFAULT_TEST_CENSUS_ALLOWANCE,
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        let stripe = StripeConfig::from_env()?;

        Ok(Self {
            stripe,
            idempotency_ttl: idempotency_ttl_from_env()?,
            ledger_sweep_interval: parse_interval(
                "LEDGER_SWEEP_INTERVAL_SECS",
                DEFAULT_LEDGER_SWEEP_INTERVAL_SECS,
            )?,
            lock_eviction_interval: parse_interval(
                "LOCK_EVICTION_INTERVAL_SECS",
                DEFAULT_LOCK_EVICTION_INTERVAL_SECS,
            )?,
            test_census_allowance: parse_var(
                "TEST_CENSUS_ALLOWANCE",
                DEFAULT_TEST_CENSUS_ALLOWANCE,
            )?,
        })
    }
}

/// Ledger retention from `IDEMPOTENCY_TTL_HOURS`, without requiring Stripe credentials
pub fn idempotency_ttl_from_env() -> BillingResult<Duration> {
    let hours: u64 = parse_var("IDEMPOTENCY_TTL_HOURS", DEFAULT_IDEMPOTENCY_TTL_HOURS)?;
    Ok(Duration::from_secs(hours * 3600))
}

/// Timer period in seconds; zero is rejected because a zero-period timer panics
fn parse_interval(name: &str, default_secs: u64) -> BillingResult<Duration> {
    let secs: u64 = parse_var(name, default_secs)?;
    if secs == 0 {
        return Err(BillingError::Config(format!("{} must be greater than zero", name)));
    }
    Ok(Duration::from_secs(secs))
}

fn required_var(name: &str) -> BillingResult<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(BillingError::Config(format!("{} must be set", name))),
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> BillingResult<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(default),
    }
}
