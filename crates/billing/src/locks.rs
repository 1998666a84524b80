//! Per-tenant mutual exclusion
//!
//! One async mutex per organization address. Different tenants never contend;
//! the same tenant is fully serialized for the lifetime of the returned guard.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

/// Held tenant lock; released when dropped
pub type TenantGuard = OwnedMutexGuard<()>;

#[derive(Default)]
pub struct EntityLockManager {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl EntityLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `tenant`
    pub async fn lock(&self, tenant: &str) -> TenantGuard {
        // The entry API makes load-or-create atomic per shard, so racing
        // callers always share one mutex. The shard guard is dropped before
        // awaiting.
        let mutex = self
            .locks
            .entry(tenant.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        mutex.lock_owned().await
    }

    /// Drop mutexes nobody holds or waits on. Returns how many were removed.
    ///
    /// A clone of the `Arc` lives in every guard and every caller between
    /// lookup and acquisition, so a count of one means only the map refers to it.
    /// `retain` runs under the shard write lock, which also blocks new lookups.
    pub fn evict_idle(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        let evicted = before.saturating_sub(self.locks.len());
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.locks.len(), "Evicted idle tenant locks");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Run [`evict_idle`](Self::evict_idle) every `interval`
    pub fn spawn_evictor(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.evict_idle();
            }
        })
    }
}
