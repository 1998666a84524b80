//! In-memory `BillingStore`
//!
//! Backed by `DashMap`, suitable for a single process and for tests. An
//! optional per-operation latency widens interleavings between concurrent
//! callers so races surface in tests.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use time::OffsetDateTime;

use crate::store::{BillingStore, StoreError, StoreResult};
use crate::types::{Organization, OrganizationSubscription, Plan, UsageSnapshot};

#[derive(Default)]
pub struct MemoryStore {
    organizations: DashMap<String, Organization>,
    plans: DashMap<i64, Plan>,
    next_plan_id: AtomicI64,
    snapshots: DashMap<(String, OffsetDateTime), UsageSnapshot>,
    drafts: DashMap<String, i64>,
    members: DashMap<String, i64>,
    sub_orgs: DashMap<String, i64>,
    latency: Option<Duration>,
    subscription_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every operation
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of subscription writes performed so far
    pub fn subscription_write_count(&self) -> usize {
        self.subscription_writes.load(Ordering::SeqCst)
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    pub fn set_draft_count(&self, address: &str, count: i64) {
        self.drafts.insert(address.to_string(), count);
    }

    pub fn set_member_count(&self, address: &str, count: i64) {
        self.members.insert(address.to_string(), count);
    }

    pub fn set_sub_org_count(&self, address: &str, count: i64) {
        self.sub_orgs.insert(address.to_string(), count);
    }

    async fn pause(&self) {
        match self.latency {
            Some(latency) => tokio::time::sleep(latency).await,
            None => tokio::task::yield_now().await,
        }
    }

    fn count(map: &DashMap<String, i64>, address: &str) -> i64 {
        map.get(address).map(|c| *c.value()).unwrap_or(0)
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn get_organization(&self, address: &str) -> StoreResult<Option<Organization>> {
        self.pause().await;
        Ok(self.organizations.get(address).map(|o| o.value().clone()))
    }

    async fn set_organization(&self, org: &Organization) -> StoreResult<()> {
        self.pause().await;
        self.organizations.insert(org.address.clone(), org.clone());
        Ok(())
    }

    async fn set_organization_subscription(
        &self,
        address: &str,
        subscription: &OrganizationSubscription,
    ) -> StoreResult<()> {
        self.pause().await;
        match self.organizations.get_mut(address) {
            Some(mut org) => {
                org.subscription = subscription.clone();
                self.subscription_writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("organization {}", address))),
        }
    }

    async fn list_organizations(&self) -> StoreResult<Vec<Organization>> {
        self.pause().await;
        let mut orgs: Vec<Organization> =
            self.organizations.iter().map(|o| o.value().clone()).collect();
        orgs.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(orgs)
    }

    async fn get_plan(&self, plan_id: i64) -> StoreResult<Option<Plan>> {
        self.pause().await;
        Ok(self.plans.get(&plan_id).map(|p| p.value().clone()))
    }

    async fn get_plan_by_product_id(&self, product_id: &str) -> StoreResult<Option<Plan>> {
        self.pause().await;
        Ok(self
            .plans
            .iter()
            .find(|p| p.provider_product_id == product_id)
            .map(|p| p.value().clone()))
    }

    async fn get_default_plan(&self) -> StoreResult<Option<Plan>> {
        self.pause().await;
        Ok(self
            .plans
            .iter()
            .find(|p| p.is_default)
            .map(|p| p.value().clone()))
    }

    async fn set_plan(&self, plan: &Plan) -> StoreResult<i64> {
        self.pause().await;
        let mut plan = plan.clone();
        if plan.id == 0 {
            plan.id = self.next_plan_id.fetch_add(1, Ordering::SeqCst) + 1;
        } else {
            self.next_plan_id.fetch_max(plan.id, Ordering::SeqCst);
        }
        let id = plan.id;
        self.plans.insert(id, plan);
        Ok(id)
    }

    async fn list_plans(&self) -> StoreResult<Vec<Plan>> {
        self.pause().await;
        let mut plans: Vec<Plan> = self.plans.iter().map(|p| p.value().clone()).collect();
        plans.sort_by_key(|p| p.id);
        Ok(plans)
    }

    async fn get_usage_snapshot(
        &self,
        address: &str,
        period_start: OffsetDateTime,
    ) -> StoreResult<Option<UsageSnapshot>> {
        self.pause().await;
        Ok(self
            .snapshots
            .get(&(address.to_string(), period_start))
            .map(|s| s.value().clone()))
    }

    async fn upsert_usage_snapshot(&self, snapshot: &UsageSnapshot) -> StoreResult<UsageSnapshot> {
        self.pause().await;
        let key = (snapshot.org_address.clone(), snapshot.period_start);
        match self.snapshots.entry(key) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(snapshot.clone());
                Ok(snapshot.clone())
            }
        }
    }

    async fn count_draft_processes(&self, address: &str) -> StoreResult<i64> {
        self.pause().await;
        Ok(Self::count(&self.drafts, address))
    }

    async fn count_members(&self, address: &str) -> StoreResult<i64> {
        self.pause().await;
        Ok(Self::count(&self.members, address))
    }

    async fn count_sub_organizations(&self, address: &str) -> StoreResult<i64> {
        self.pause().await;
        Ok(Self::count(&self.sub_orgs, address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BillingPeriod, UsageCounters};
    use time::macros::datetime;
    use uuid::Uuid;

    fn snapshot(address: &str, baseline: UsageCounters) -> UsageSnapshot {
        UsageSnapshot {
            id: Uuid::new_v4(),
            org_address: address.to_string(),
            period_start: datetime!(2026-01-15 0:00 UTC),
            period_end: datetime!(2027-01-15 0:00 UTC),
            billing_period: BillingPeriod::Annual,
            baseline,
            created_at: datetime!(2026-02-01 0:00 UTC),
        }
    }

    #[tokio::test]
    async fn test_upsert_snapshot_keeps_first() {
        let store = MemoryStore::new();
        let first = store
            .upsert_usage_snapshot(&snapshot("0xa", UsageCounters::new(1, 1, 1)))
            .await
            .unwrap();
        let second = store
            .upsert_usage_snapshot(&snapshot("0xa", UsageCounters::new(9, 9, 9)))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(second.baseline, UsageCounters::new(1, 1, 1));
        assert_eq!(store.snapshot_count(), 1);
    }

    #[tokio::test]
    async fn test_set_subscription_requires_organization() {
        let store = MemoryStore::new();
        let err = store
            .set_organization_subscription("0xmissing", &OrganizationSubscription::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert_eq!(store.subscription_write_count(), 0);
    }

    #[tokio::test]
    async fn test_plan_ids_are_assigned() {
        let store = MemoryStore::new();
        let free = store
            .set_plan(&Plan {
                name: "free".to_string(),
                is_default: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let pro = store
            .set_plan(&Plan {
                name: "pro".to_string(),
                provider_product_id: "prod_pro".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_ne!(free, pro);
        assert_eq!(store.get_default_plan().await.unwrap().unwrap().id, free);
        assert_eq!(
            store
                .get_plan_by_product_id("prod_pro")
                .await
                .unwrap()
                .unwrap()
                .name,
            "pro"
        );
    }
}
