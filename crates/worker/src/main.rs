//! Tally Background Worker
//!
//! Handles scheduled jobs including:
//! - Idempotency ledger retention (hourly)
//! - Billing invariant checks (daily at 3:00 AM UTC)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use tally_billing::{
    idempotency_ttl_from_env, IdempotencyLedger, InvariantCheckSummary, InvariantChecker,
    PgLedger,
};
use tally_shared::{create_pool, run_migrations, BillingStore, PgStore};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Log results of an invariant check run
fn log_invariant_summary(summary: &InvariantCheckSummary) {
    info!(
        checks_run = summary.checks_run,
        checks_passed = summary.checks_passed,
        checks_failed = summary.checks_failed,
        healthy = summary.healthy,
        "Invariant check cycle complete"
    );

    if !summary.healthy {
        warn!(
            violations = summary.violations.len(),
            "Billing invariants violated, see preceding warnings"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Tally Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    run_migrations(&pool).await?;

    let ttl = idempotency_ttl_from_env()?;
    let ledger = Arc::new(PgLedger::new(pool.clone(), ttl));
    let store: Arc<dyn BillingStore> = Arc::new(PgStore::new(pool));
    let checker = Arc::new(InvariantChecker::new(store));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Purge processed webhook events older than the ledger TTL
    let purge_ledger = ledger.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let ledger = purge_ledger.clone();
            Box::pin(async move {
                info!("Running idempotency ledger purge");
                if let Err(e) = ledger.purge_expired().await {
                    error!(error = %e, "Idempotency ledger purge failed");
                }
            })
        })?)
        .await?;
    info!(ttl_hours = ttl.as_secs() / 3600, "Scheduled: Idempotency ledger purge (hourly)");

    // Job 2: Billing invariant checks
    let invariant_checker = checker.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let checker = invariant_checker.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                match checker.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Invariant checks failed to run"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (daily at 3:00 AM UTC)");

    // Job 3: Health check heartbeat
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Tally Worker started successfully with {} scheduled jobs", 3);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
