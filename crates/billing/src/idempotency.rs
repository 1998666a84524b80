//! Idempotency ledger of processed webhook events
//!
//! A record for event `E` means every side effect of `E` has been applied.
//! Records expire after the configured TTL; the provider does not redeliver
//! events that old.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::error::BillingResult;

const BUCKET_SECS: i64 = 3600;

#[async_trait]
pub trait IdempotencyLedger: Send + Sync + 'static {
    async fn exists(&self, event_id: &str) -> BillingResult<bool>;

    async fn mark_processed(&self, event_id: &str) -> BillingResult<()>;

    /// Drop records older than the TTL, returning how many were removed
    async fn purge_expired(&self) -> BillingResult<u64>;
}

fn ttl_duration(ttl: Duration) -> time::Duration {
    time::Duration::try_from(ttl).unwrap_or(time::Duration::MAX)
}

// ============ IN-MEMORY LEDGER ============

#[derive(Default)]
struct LedgerState {
    entries: HashMap<String, OffsetDateTime>,
    /// Hour bucket -> event ids marked during that hour
    buckets: BTreeMap<i64, Vec<String>>,
}

/// Process-local ledger
///
/// Entries are grouped into hour buckets so the sweeper can drop a whole
/// expired hour per critical section instead of scanning every entry.
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    ttl: time::Duration,
    clock: Arc<dyn Clock>,
}

impl InMemoryLedger {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            ttl: ttl_duration(ttl),
            clock,
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock_state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove expired entries, one hour bucket per lock acquisition.
    /// Returns the number of event ids removed.
    pub fn sweep(&self) -> usize {
        let cutoff = self.clock.now() - self.ttl;
        let cutoff_unix = cutoff.unix_timestamp();
        let mut removed = 0;

        loop {
            let mut state = self.lock_state();
            let Some((&hour, _)) = state.buckets.first_key_value() else {
                break;
            };
            if (hour + 1) * BUCKET_SECS > cutoff_unix {
                break;
            }
            let ids = state.buckets.remove(&hour).unwrap_or_default();
            for id in ids {
                // Re-marked ids live on in a newer bucket
                let expired = state
                    .entries
                    .get(&id)
                    .is_some_and(|processed_at| *processed_at <= cutoff);
                if expired {
                    state.entries.remove(&id);
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            tracing::debug!(removed, "Swept expired idempotency entries");
        }
        removed
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the handle is aborted
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep();
            }
        })
    }
}

#[async_trait]
impl IdempotencyLedger for InMemoryLedger {
    async fn exists(&self, event_id: &str) -> BillingResult<bool> {
        let now = self.clock.now();
        let state = self.lock_state();
        Ok(state
            .entries
            .get(event_id)
            .is_some_and(|processed_at| now - *processed_at < self.ttl))
    }

    async fn mark_processed(&self, event_id: &str) -> BillingResult<()> {
        let now = self.clock.now();
        let hour = now.unix_timestamp().div_euclid(BUCKET_SECS);
        let mut state = self.lock_state();
        state.entries.insert(event_id.to_string(), now);
        state
            .buckets
            .entry(hour)
            .or_default()
            .push(event_id.to_string());
        Ok(())
    }

    async fn purge_expired(&self) -> BillingResult<u64> {
        Ok(self.sweep() as u64)
    }
}

// ============ POSTGRES LEDGER ============

/// Ledger backed by the `processed_webhook_events` table
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
    ttl: time::Duration,
}

impl PgLedger {
    pub fn new(pool: PgPool, ttl: Duration) -> Self {
        Self {
            pool,
            ttl: ttl_duration(ttl),
        }
    }
}

#[async_trait]
impl IdempotencyLedger for PgLedger {
    async fn exists(&self, event_id: &str) -> BillingResult<bool> {
        let cutoff = OffsetDateTime::now_utc() - self.ttl;
        let found: (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM processed_webhook_events
                WHERE event_id = $1 AND processed_at >= $2
            )
            "#,
        )
        .bind(event_id)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(found.0)
    }

    async fn mark_processed(&self, event_id: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO processed_webhook_events (event_id, processed_at)
            VALUES ($1, NOW())
            ON CONFLICT (event_id) DO UPDATE SET processed_at = EXCLUDED.processed_at
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_expired(&self) -> BillingResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - self.ttl;
        let result = sqlx::query("DELETE FROM processed_webhook_events WHERE processed_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        let purged = result.rows_affected();
        if purged > 0 {
            tracing::info!(purged, "Purged expired processed webhook events");
        }
        Ok(purged)
    }
}
