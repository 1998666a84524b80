// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError variants carry provider messages
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Tally Billing Module
//!
//! Reconciles Stripe webhook events into organization subscriptions and
//! answers quota questions before metered actions.
//!
//! ## Features
//!
//! - **Webhooks**: Signature verification, exactly-once application per event id
//! - **Idempotency Ledger**: Processed event ids with a retention window
//! - **Tenant Locks**: Per-organization serialization of subscription writes
//! - **Subscriptions**: Plan assignment, cancellation fallback, invoice payments, catalog refresh
//! - **Usage Accounting**: Annual periods with lazily captured baselines
//! - **Entitlements**: Typed permission and quota decisions
//! - **Invariants**: Read-only consistency checks

pub mod client;
pub mod clock;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod invariants;
pub mod locks;
pub mod signature;
pub mod subscriptions;
pub mod usage;
pub mod webhooks;

#[cfg(test)]
mod test_support;

// Client
pub use client::{PaymentProvider, ProviderCustomer, ProviderPrice, ProviderProduct, StripeClient};

// Clock
pub use clock::{Clock, FixedClock, SystemClock};

// Config
pub use config::{
    idempotency_ttl_from_env, BillingConfig, StripeConfig, DEFAULT_TEST_CENSUS_ALLOWANCE,
};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{EventKind, SubscriptionStatus, WebhookEvent};

// Idempotency
pub use idempotency::{IdempotencyLedger, InMemoryLedger, PgLedger};

// Locks
pub use locks::{EntityLockManager, TenantGuard};

// Subscriptions
pub use subscriptions::{FollowUp, ReconcileOutcome, Reconciled, SubscriptionService};

// Usage
pub use usage::{PeriodUsage, PeriodWindow, UsageMeter};

// Entitlement
pub use entitlement::{
    DenialReason, EntitlementService, NewProcessTx, Permission, QuotaAction, TxRequest,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Webhooks
pub use webhooks::{WebhookHandler, WebhookOutcome};

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tally_shared::{BillingStore, PgStore};
use tokio::task::JoinHandle;

/// Background tasks started by [`BillingService::start_maintenance`]
pub struct MaintenanceHandles {
    pub ledger_sweeper: JoinHandle<()>,
    pub lock_evictor: JoinHandle<()>,
}

impl MaintenanceHandles {
    pub fn abort(&self) {
        self.ledger_sweeper.abort();
        self.lock_evictor.abort();
    }
}

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub config: BillingConfig,
    pub ledger: Arc<dyn IdempotencyLedger>,
    pub locks: Arc<EntityLockManager>,
    pub usage: Arc<UsageMeter>,
    pub subscriptions: Arc<SubscriptionService>,
    pub entitlements: EntitlementService,
    pub invariants: InvariantChecker,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a Postgres-backed billing service talking to Stripe, configured
    /// from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        let provider = Arc::new(StripeClient::new(config.stripe.clone()));
        let ledger = Arc::new(PgLedger::new(pool.clone(), config.idempotency_ttl));
        let store = Arc::new(PgStore::new(pool));
        Ok(Self::new(config, store, ledger, provider))
    }

    /// Create a billing service with a process-local ledger retaining
    /// `config.idempotency_ttl`
    pub fn with_in_memory_ledger(
        config: BillingConfig,
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn PaymentProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let ledger = Arc::new(InMemoryLedger::new(config.idempotency_ttl, clock.clone()));
        Self::with_clock(config, store, ledger, provider, clock)
    }

    /// Create a billing service with explicit collaborators
    pub fn new(
        config: BillingConfig,
        store: Arc<dyn BillingStore>,
        ledger: Arc<dyn IdempotencyLedger>,
        provider: Arc<dyn PaymentProvider>,
    ) -> Self {
        Self::with_clock(config, store, ledger, provider, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: BillingConfig,
        store: Arc<dyn BillingStore>,
        ledger: Arc<dyn IdempotencyLedger>,
        provider: Arc<dyn PaymentProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let locks = Arc::new(EntityLockManager::new());
        let usage = Arc::new(UsageMeter::new(store.clone(), clock.clone()));
        let subscriptions = Arc::new(SubscriptionService::new(
            store.clone(),
            provider.clone(),
            usage.clone(),
            clock,
        ));

        Self {
            entitlements: EntitlementService::new(
                store.clone(),
                usage.clone(),
                config.test_census_allowance,
            ),
            invariants: InvariantChecker::new(store),
            webhooks: WebhookHandler::new(
                provider,
                ledger.clone(),
                locks.clone(),
                subscriptions.clone(),
            ),
            config,
            ledger,
            locks,
            usage,
            subscriptions,
        }
    }

    /// Spawn the ledger retention sweep and the idle lock eviction
    pub fn start_maintenance(&self) -> MaintenanceHandles {
        let ledger = self.ledger.clone();
        let ledger_sweeper = spawn_every(self.config.ledger_sweep_interval, move || {
            let ledger = ledger.clone();
            async move {
                if let Err(e) = ledger.purge_expired().await {
                    tracing::warn!(error = %e, "Failed to purge expired idempotency records");
                }
            }
        });

        let lock_evictor = self
            .locks
            .clone()
            .spawn_evictor(self.config.lock_eviction_interval);

        tracing::info!(
            ledger_sweep_secs = self.config.ledger_sweep_interval.as_secs(),
            lock_eviction_secs = self.config.lock_eviction_interval.as_secs(),
            "Billing maintenance tasks started"
        );

        MaintenanceHandles {
            ledger_sweeper,
            lock_evictor,
        }
    }
}

fn spawn_every<F, Fut>(interval: Duration, mut task: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            task().await;
        }
    })
}
