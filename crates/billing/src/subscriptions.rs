//! Subscription reconciliation
//!
//! Maps typed provider events onto the stored organization subscription and
//! the plan catalog. Every write is an absolute overwrite, so replaying an
//! event (or applying it after a partial failure) converges to the same
//! record. Callers hold the tenant lock for subscription and invoice events.
//!
//! Work is split in two phases. The required phase returns an error and must
//! succeed before the event counts as processed. The [`FollowUp`] phase
//! carries best-effort provider updates whose failures are only logged.

use std::collections::HashMap;
use std::sync::Arc;

use tally_shared::{BillingPeriod, BillingStore, Organization, OrganizationSubscription, Plan};

use crate::client::{PaymentProvider, ProviderCustomer, ProviderPrice, ProviderProduct};
use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::events::{
    CustomerRef, InvoicePaidEvent, ProductUpdatedEvent, SubscriptionEvent, SubscriptionStatus,
    ORG_ADDRESS_METADATA_KEY,
};
use crate::usage::UsageMeter;

/// Product metadata key holding plan limits as JSON
pub const LIMITS_METADATA_KEY: &str = "limits";
/// Product metadata key holding plan features as JSON
pub const FEATURES_METADATA_KEY: &str = "features";
/// Product metadata key holding the free trial length in days
pub const FREE_TRIAL_DAYS_METADATA_KEY: &str = "free_trial_days";

/// What a reconciliation step did to stored state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A new record was written
    Updated,
    /// The organization was moved to the default plan
    FellBackToDefault,
    /// Stored state already matched, or the event does not apply
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CustomerBackfill {
    customer_id: String,
    org_address: String,
}

/// Best-effort work left over after the required writes committed
#[derive(Debug, Default, PartialEq, Eq)]
#[must_use]
pub struct FollowUp {
    customer_backfill: Option<CustomerBackfill>,
}

impl FollowUp {
    pub fn is_empty(&self) -> bool {
        self.customer_backfill.is_none()
    }
}

/// Result of the required phase of a subscription event
#[derive(Debug, PartialEq, Eq)]
pub struct Reconciled {
    pub outcome: ReconcileOutcome,
    pub follow_up: FollowUp,
}

impl Reconciled {
    fn done(outcome: ReconcileOutcome) -> Self {
        Self {
            outcome,
            follow_up: FollowUp::default(),
        }
    }
}

pub struct SubscriptionService {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn PaymentProvider>,
    usage: Arc<UsageMeter>,
    clock: Arc<dyn Clock>,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn PaymentProvider>,
        usage: Arc<UsageMeter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            provider,
            usage,
            clock,
        }
    }

    async fn load_organization(&self, org_address: &str) -> BillingResult<Organization> {
        self.store
            .get_organization(org_address)
            .await?
            .ok_or_else(|| BillingError::OrganizationNotFound(org_address.to_string()))
    }

    // ============ SUBSCRIPTION EVENTS ============

    /// Required phase of `customer.subscription.*`
    pub async fn apply_subscription_event(
        &self,
        event: &SubscriptionEvent,
    ) -> BillingResult<Reconciled> {
        let org = self.load_organization(&event.org_address).await?;

        match event.status {
            SubscriptionStatus::Active | SubscriptionStatus::Trialing => {
                self.apply_active_subscription(org, event).await
            }
            SubscriptionStatus::Canceled | SubscriptionStatus::Unpaid => self
                .fallback_to_default_plan(&org, &event.subscription_id)
                .await
                .map(Reconciled::done),
            other => {
                tracing::info!(
                    org_address = %event.org_address,
                    subscription_id = %event.subscription_id,
                    status = %other,
                    "Subscription status does not change plan assignment"
                );
                Ok(Reconciled::done(ReconcileOutcome::Unchanged))
            }
        }
    }

    async fn apply_active_subscription(
        &self,
        org: Organization,
        event: &SubscriptionEvent,
    ) -> BillingResult<Reconciled> {
        let plan = self
            .store
            .get_plan_by_product_id(&event.product_id)
            .await?
            .ok_or_else(|| BillingError::PlanNotFound(event.product_id.clone()))?;

        let customer = self.resolve_customer(&event.customer).await;
        let email = customer
            .as_ref()
            .and_then(|c| c.email.clone())
            .unwrap_or_else(|| org.subscription.email.clone());

        let subscription = OrganizationSubscription {
            plan_id: plan.id,
            provider_subscription_id: event.subscription_id.clone(),
            billing_period: event.billing_period,
            start_date: Some(event.current_period_start),
            renewal_date: Some(event.current_period_end),
            last_payment_date: org.subscription.last_payment_date,
            active: true,
            email,
        };

        let outcome = if subscription == org.subscription {
            ReconcileOutcome::Unchanged
        } else {
            self.store
                .set_organization_subscription(&org.address, &subscription)
                .await?;
            tracing::info!(
                org_address = %org.address,
                plan_id = plan.id,
                plan = %plan.name,
                subscription_id = %event.subscription_id,
                billing_period = %event.billing_period,
                "Subscription applied"
            );
            ReconcileOutcome::Updated
        };

        if event.billing_period == BillingPeriod::Annual {
            let updated = Organization {
                subscription,
                ..org
            };
            self.usage.ensure_snapshot(&updated).await?;
        }

        let customer_backfill = customer
            .filter(|c| {
                c.metadata.get(ORG_ADDRESS_METADATA_KEY).map(String::as_str)
                    != Some(event.org_address.as_str())
            })
            .map(|c| CustomerBackfill {
                customer_id: c.id,
                org_address: event.org_address.clone(),
            });

        Ok(Reconciled {
            outcome,
            follow_up: FollowUp { customer_backfill },
        })
    }

    /// Customer details for enrichment; `None` when the provider could not be reached
    async fn resolve_customer(&self, customer: &CustomerRef) -> Option<ProviderCustomer> {
        if let Some(metadata) = &customer.metadata {
            return Some(ProviderCustomer {
                id: customer.id.clone(),
                email: customer.email.clone(),
                metadata: metadata.clone(),
            });
        }

        match self.provider.get_customer(&customer.id).await {
            Ok(found) => Some(found),
            Err(e) => {
                tracing::warn!(
                    customer_id = %customer.id,
                    error = %e,
                    "Failed to fetch customer, keeping stored billing email"
                );
                None
            }
        }
    }

    /// Replace the subscription with a default-plan record.
    ///
    /// Keeps `last_payment_date`, clears the provider subscription and restarts
    /// billing at now. A cancellation for a subscription other than the live
    /// one is stale and ignored.
    pub async fn fallback_to_default_plan(
        &self,
        org: &Organization,
        canceled_subscription_id: &str,
    ) -> BillingResult<ReconcileOutcome> {
        let current = &org.subscription;

        if current.has_provider_subscription()
            && current.provider_subscription_id != canceled_subscription_id
        {
            tracing::warn!(
                org_address = %org.address,
                live_subscription_id = %current.provider_subscription_id,
                canceled_subscription_id = %canceled_subscription_id,
                "Ignoring cancellation of a subscription that is no longer live"
            );
            return Ok(ReconcileOutcome::Unchanged);
        }

        let default_plan = self
            .store
            .get_default_plan()
            .await?
            .ok_or(BillingError::DefaultPlanMissing)?;

        if !current.has_provider_subscription() && current.plan_id == default_plan.id {
            tracing::info!(
                org_address = %org.address,
                "Organization already on default plan"
            );
            return Ok(ReconcileOutcome::Unchanged);
        }

        let subscription = OrganizationSubscription {
            plan_id: default_plan.id,
            provider_subscription_id: String::new(),
            billing_period: BillingPeriod::Monthly,
            start_date: Some(self.clock.now()),
            renewal_date: None,
            last_payment_date: current.last_payment_date,
            active: true,
            email: String::new(),
        };

        self.store
            .set_organization_subscription(&org.address, &subscription)
            .await?;

        tracing::info!(
            org_address = %org.address,
            previous_plan_id = current.plan_id,
            default_plan_id = default_plan.id,
            canceled_subscription_id = %canceled_subscription_id,
            "Subscription ended, organization moved to default plan"
        );

        Ok(ReconcileOutcome::FellBackToDefault)
    }

    /// Run best-effort work. Never fails.
    pub async fn run_follow_up(&self, follow_up: FollowUp) {
        let Some(backfill) = follow_up.customer_backfill else {
            return;
        };

        let metadata = HashMap::from([(
            ORG_ADDRESS_METADATA_KEY.to_string(),
            backfill.org_address.clone(),
        )]);

        if let Err(e) = self
            .provider
            .update_customer_metadata(&backfill.customer_id, metadata)
            .await
        {
            tracing::warn!(
                customer_id = %backfill.customer_id,
                org_address = %backfill.org_address,
                error = %e,
                "Failed to backfill org_address on customer metadata"
            );
        } else {
            tracing::debug!(
                customer_id = %backfill.customer_id,
                org_address = %backfill.org_address,
                "Backfilled org_address on customer metadata"
            );
        }
    }

    // ============ INVOICE EVENTS ============

    /// `invoice.payment_succeeded`: only `last_payment_date` changes
    pub async fn apply_invoice_paid(
        &self,
        event: &InvoicePaidEvent,
    ) -> BillingResult<ReconcileOutcome> {
        let org = self.load_organization(&event.org_address).await?;

        if org.subscription.last_payment_date == Some(event.effective_at) {
            return Ok(ReconcileOutcome::Unchanged);
        }

        let subscription = OrganizationSubscription {
            last_payment_date: Some(event.effective_at),
            ..org.subscription
        };
        self.store
            .set_organization_subscription(&org.address, &subscription)
            .await?;

        tracing::info!(
            org_address = %org.address,
            invoice_id = %event.invoice_id,
            paid_at = %event.effective_at,
            "Recorded invoice payment"
        );

        Ok(ReconcileOutcome::Updated)
    }

    // ============ PRODUCT EVENTS ============

    /// `product.updated`: refresh the plan sold under this product, if any.
    /// Callers serialize catalog updates.
    pub async fn apply_product_updated(
        &self,
        event: &ProductUpdatedEvent,
    ) -> BillingResult<ReconcileOutcome> {
        let Some(plan) = self.store.get_plan_by_product_id(&event.product_id).await? else {
            tracing::info!(
                product_id = %event.product_id,
                "Product is not offered as a plan, ignoring update"
            );
            return Ok(ReconcileOutcome::Unchanged);
        };

        let product = self.provider.get_product(&event.product_id).await?;
        let prices = self.provider.get_product_prices(&event.product_id).await?;
        let refreshed = plan_from_provider_product(&plan, &product, &prices)?;

        if refreshed == plan {
            return Ok(ReconcileOutcome::Unchanged);
        }

        self.store.set_plan(&refreshed).await?;
        tracing::info!(
            plan_id = plan.id,
            product_id = %event.product_id,
            "Plan refreshed from provider catalog"
        );
        Ok(ReconcileOutcome::Updated)
    }
}

fn recurring_amount(prices: &[ProviderPrice], period: BillingPeriod) -> Option<i64> {
    prices
        .iter()
        .filter(|p| p.active && p.interval == Some(period))
        .find_map(|p| p.unit_amount)
}

fn metadata_json<T: serde::de::DeserializeOwned>(
    product: &ProviderProduct,
    key: &str,
) -> BillingResult<Option<T>> {
    product
        .metadata
        .get(key)
        .map(|raw| {
            serde_json::from_str(raw).map_err(|e| {
                BillingError::InvalidProviderData(format!(
                    "product {} metadata {:?}: {}",
                    product.id, key, e
                ))
            })
        })
        .transpose()
}

/// Derive the plan for `product` from its current provider data.
///
/// Identity and the default flag come from `existing`. Metadata keys that are
/// absent keep the stored values; prices always follow the provider.
pub fn plan_from_provider_product(
    existing: &Plan,
    product: &ProviderProduct,
    prices: &[ProviderPrice],
) -> BillingResult<Plan> {
    let limits = metadata_json(product, LIMITS_METADATA_KEY)?.unwrap_or(existing.limits);
    let features = metadata_json(product, FEATURES_METADATA_KEY)?.unwrap_or(existing.features);

    let free_trial_days = match product.metadata.get(FREE_TRIAL_DAYS_METADATA_KEY) {
        Some(raw) => raw.trim().parse::<i64>().ok().filter(|d| *d >= 0).ok_or_else(|| {
            BillingError::InvalidProviderData(format!(
                "product {} has invalid free_trial_days: {}",
                product.id, raw
            ))
        })?,
        None => existing.free_trial_days,
    };

    let name = if product.name.trim().is_empty() {
        existing.name.clone()
    } else {
        product.name.clone()
    };

    Ok(Plan {
        id: existing.id,
        name,
        provider_product_id: existing.provider_product_id.clone(),
        monthly_price_cents: recurring_amount(prices, BillingPeriod::Monthly),
        yearly_price_cents: recurring_amount(prices, BillingPeriod::Annual),
        is_default: existing.is_default,
        free_trial_days,
        limits,
        features,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::test_support::{
        seed_catalog, subscription_event, FakeProvider, DEFAULT_PLAN_ID, PRO_PLAN_ID,
    };
    use tally_shared::{MemoryStore, PlanLimits, UsageCounters};
    use time::macros::datetime;

    fn monthly_event(org: &str, sub: &str, status: SubscriptionStatus) -> SubscriptionEvent {
        subscription_event(org, sub, status, BillingPeriod::Monthly)
    }

    struct Harness {
        store: Arc<MemoryStore>,
        provider: Arc<FakeProvider>,
        clock: Arc<FixedClock>,
        service: SubscriptionService,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        seed_catalog(&store).await;
        store.set_organization(&Organization::new("0xorg")).await.unwrap();

        let clock = Arc::new(FixedClock::new(datetime!(2026-01-15 12:00 UTC)));
        let provider = Arc::new(FakeProvider::new(clock.clone()));
        provider.add_customer("cus_0xorg", Some("billing@0xorg.test"));
        let usage = Arc::new(UsageMeter::new(store.clone(), clock.clone()));
        let service =
            SubscriptionService::new(store.clone(), provider.clone(), usage, clock.clone());

        Harness {
            store,
            provider,
            clock,
            service,
        }
    }

    // ========================================================================
    // Active subscriptions
    // ========================================================================

    #[tokio::test]
    async fn test_active_subscription_overwrites_record() {
        let h = harness().await;
        let event = monthly_event("0xorg", "sub_1", SubscriptionStatus::Active);

        let result = h.service.apply_subscription_event(&event).await.unwrap();
        assert_eq!(result.outcome, ReconcileOutcome::Updated);

        let sub = h.store.get_organization("0xorg").await.unwrap().unwrap().subscription;
        assert_eq!(sub.plan_id, PRO_PLAN_ID);
        assert_eq!(sub.provider_subscription_id, "sub_1");
        assert_eq!(sub.start_date, Some(event.current_period_start));
        assert_eq!(sub.renewal_date, Some(event.current_period_end));
        assert!(sub.active);
        assert_eq!(sub.email, "billing@0xorg.test");
    }

    #[tokio::test]
    async fn test_replayed_subscription_writes_once() {
        let h = harness().await;
        let event = monthly_event("0xorg", "sub_1", SubscriptionStatus::Active);

        h.service.apply_subscription_event(&event).await.unwrap();
        let again = h.service.apply_subscription_event(&event).await.unwrap();

        assert_eq!(again.outcome, ReconcileOutcome::Unchanged);
        assert_eq!(h.store.subscription_write_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_product_is_fatal_without_mutation() {
        let h = harness().await;
        let mut event = monthly_event("0xorg", "sub_1", SubscriptionStatus::Active);
        event.product_id = "prod_unknown".into();

        let err = h.service.apply_subscription_event(&event).await.unwrap_err();
        assert!(matches!(err, BillingError::PlanNotFound(id) if id == "prod_unknown"));
        assert_eq!(h.store.subscription_write_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_organization_is_not_found() {
        let h = harness().await;
        let event = monthly_event("0xnobody", "sub_1", SubscriptionStatus::Active);
        assert!(matches!(
            h.service.apply_subscription_event(&event).await,
            Err(BillingError::OrganizationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_past_due_leaves_state_unchanged() {
        let h = harness().await;
        let event = monthly_event("0xorg", "sub_1", SubscriptionStatus::PastDue);
        let result = h.service.apply_subscription_event(&event).await.unwrap();
        assert_eq!(result.outcome, ReconcileOutcome::Unchanged);
        assert_eq!(h.store.subscription_write_count(), 0);
    }

    #[tokio::test]
    async fn test_annual_subscription_captures_baseline() {
        let h = harness().await;
        let mut org = h.store.get_organization("0xorg").await.unwrap().unwrap();
        org.counters = UsageCounters::new(3, 4, 2);
        h.store.set_organization(&org).await.unwrap();

        let event =
            subscription_event("0xorg", "sub_1", SubscriptionStatus::Active, BillingPeriod::Annual);
        h.service.apply_subscription_event(&event).await.unwrap();

        let snapshot = h
            .store
            .get_usage_snapshot("0xorg", event.current_period_start)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.baseline, UsageCounters::new(3, 4, 2));
    }

    // ========================================================================
    // Customer backfill
    // ========================================================================

    #[tokio::test]
    async fn test_backfill_when_customer_lacks_org_address() {
        let h = harness().await;
        let event = monthly_event("0xorg", "sub_1", SubscriptionStatus::Active);

        let result = h.service.apply_subscription_event(&event).await.unwrap();
        assert!(!result.follow_up.is_empty());
        h.service.run_follow_up(result.follow_up).await;

        let customer = h.provider.customer(&event.customer.id).unwrap();
        assert_eq!(
            customer.metadata.get(ORG_ADDRESS_METADATA_KEY).map(String::as_str),
            Some("0xorg")
        );
        assert_eq!(h.provider.metadata_update_count(), 1);

        let replay = h.service.apply_subscription_event(&event).await.unwrap();
        assert!(replay.follow_up.is_empty());
        h.service.run_follow_up(replay.follow_up).await;
        assert_eq!(h.provider.metadata_update_count(), 1);
    }

    #[tokio::test]
    async fn test_backfill_failure_is_swallowed() {
        let h = harness().await;
        h.provider.fail_metadata_updates(true);
        let event = monthly_event("0xorg", "sub_1", SubscriptionStatus::Active);

        let result = h.service.apply_subscription_event(&event).await.unwrap();
        h.service.run_follow_up(result.follow_up).await;

        let sub = h.store.get_organization("0xorg").await.unwrap().unwrap().subscription;
        assert_eq!(sub.plan_id, PRO_PLAN_ID);
        assert_eq!(h.provider.metadata_update_count(), 0);
    }

    #[tokio::test]
    async fn test_customer_lookup_failure_keeps_email() {
        let h = harness().await;
        let mut event = monthly_event("0xorg", "sub_1", SubscriptionStatus::Active);
        event.customer.id = "cus_missing".into();

        let result = h.service.apply_subscription_event(&event).await.unwrap();
        assert_eq!(result.outcome, ReconcileOutcome::Updated);
        assert!(result.follow_up.is_empty());
        let sub = h.store.get_organization("0xorg").await.unwrap().unwrap().subscription;
        assert_eq!(sub.email, "");
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    #[tokio::test]
    async fn test_cancel_falls_back_to_default_plan() {
        let h = harness().await;
        let active = monthly_event("0xorg", "sub_1", SubscriptionStatus::Active);
        h.service.apply_subscription_event(&active).await.unwrap();

        let paid_at = datetime!(2026-01-16 09:00 UTC);
        let mut org = h.store.get_organization("0xorg").await.unwrap().unwrap();
        org.subscription.last_payment_date = Some(paid_at);
        h.store.set_organization(&org).await.unwrap();

        h.clock.set(datetime!(2026-02-01 00:00 UTC));
        let canceled = monthly_event("0xorg", "sub_1", SubscriptionStatus::Canceled);
        let result = h.service.apply_subscription_event(&canceled).await.unwrap();
        assert_eq!(result.outcome, ReconcileOutcome::FellBackToDefault);

        let sub = h.store.get_organization("0xorg").await.unwrap().unwrap().subscription;
        assert_eq!(sub.plan_id, DEFAULT_PLAN_ID);
        assert!(sub.provider_subscription_id.is_empty());
        assert_eq!(sub.last_payment_date, Some(paid_at));
        assert_eq!(sub.start_date, Some(datetime!(2026-02-01 00:00 UTC)));
        assert!(sub.active);

        let writes = h.store.subscription_write_count();
        let replay = h.service.apply_subscription_event(&canceled).await.unwrap();
        assert_eq!(replay.outcome, ReconcileOutcome::Unchanged);
        assert_eq!(h.store.subscription_write_count(), writes);
    }

    #[tokio::test]
    async fn test_stale_cancel_is_ignored() {
        let h = harness().await;
        let active = monthly_event("0xorg", "sub_new", SubscriptionStatus::Active);
        h.service.apply_subscription_event(&active).await.unwrap();

        let stale = monthly_event("0xorg", "sub_old", SubscriptionStatus::Canceled);
        let result = h.service.apply_subscription_event(&stale).await.unwrap();
        assert_eq!(result.outcome, ReconcileOutcome::Unchanged);

        let sub = h.store.get_organization("0xorg").await.unwrap().unwrap().subscription;
        assert_eq!(sub.provider_subscription_id, "sub_new");
    }

    #[tokio::test]
    async fn test_cancel_without_default_plan_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        store.set_organization(&Organization::new("0xorg")).await.unwrap();
        let clock = Arc::new(FixedClock::new(datetime!(2026-01-15 12:00 UTC)));
        let provider = Arc::new(FakeProvider::new(clock.clone()));
        let usage = Arc::new(UsageMeter::new(store.clone(), clock.clone()));
        let service = SubscriptionService::new(store.clone(), provider, usage, clock);

        let canceled = monthly_event("0xorg", "sub_1", SubscriptionStatus::Unpaid);
        assert!(matches!(
            service.apply_subscription_event(&canceled).await,
            Err(BillingError::DefaultPlanMissing)
        ));
        assert_eq!(store.subscription_write_count(), 0);
    }

    // ========================================================================
    // Invoices
    // ========================================================================

    #[tokio::test]
    async fn test_invoice_updates_only_last_payment_date() {
        let h = harness().await;
        let active = monthly_event("0xorg", "sub_1", SubscriptionStatus::Active);
        h.service.apply_subscription_event(&active).await.unwrap();
        let before = h.store.get_organization("0xorg").await.unwrap().unwrap().subscription;

        let invoice = InvoicePaidEvent {
            invoice_id: "in_1".into(),
            org_address: "0xorg".into(),
            effective_at: datetime!(2026-01-15 12:05 UTC),
        };
        assert_eq!(
            h.service.apply_invoice_paid(&invoice).await.unwrap(),
            ReconcileOutcome::Updated
        );
        assert_eq!(
            h.service.apply_invoice_paid(&invoice).await.unwrap(),
            ReconcileOutcome::Unchanged
        );

        let after = h.store.get_organization("0xorg").await.unwrap().unwrap().subscription;
        assert_eq!(after.last_payment_date, Some(invoice.effective_at));
        assert_eq!(
            OrganizationSubscription {
                last_payment_date: before.last_payment_date,
                ..after
            },
            before
        );
    }

    // ========================================================================
    // Products
    // ========================================================================

    fn product(metadata: &[(&str, &str)]) -> ProviderProduct {
        ProviderProduct {
            id: "prod_pro".into(),
            name: "Pro".into(),
            active: true,
            metadata: metadata
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn price(interval: BillingPeriod, amount: i64, active: bool) -> ProviderPrice {
        ProviderPrice {
            id: format!("price_{}_{}", interval, amount),
            active,
            interval: Some(interval),
            unit_amount: Some(amount),
        }
    }

    #[test]
    fn test_plan_from_provider_product() {
        let existing = Plan {
            id: 7,
            name: "Old name".into(),
            provider_product_id: "prod_pro".into(),
            free_trial_days: 14,
            limits: PlanLimits {
                max_processes: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let product = product(&[("limits", r#"{"maxProcesses": 50, "maxCensus": 1000}"#)]);
        let prices = vec![
            price(BillingPeriod::Monthly, 900, false),
            price(BillingPeriod::Monthly, 1900, true),
            price(BillingPeriod::Annual, 19000, true),
        ];

        let plan = plan_from_provider_product(&existing, &product, &prices).unwrap();
        assert_eq!(plan.id, 7);
        assert_eq!(plan.name, "Pro");
        assert_eq!(plan.limits.max_processes, 50);
        assert_eq!(plan.limits.max_census, 1000);
        assert_eq!(plan.free_trial_days, 14);
        assert_eq!(plan.monthly_price_cents, Some(1900));
        assert_eq!(plan.yearly_price_cents, Some(19000));
    }

    #[test]
    fn test_malformed_product_metadata_is_rejected() {
        let existing = Plan::default();
        let bad_limits = product(&[("limits", "{not json")]);
        assert!(matches!(
            plan_from_provider_product(&existing, &bad_limits, &[]),
            Err(BillingError::InvalidProviderData(_))
        ));

        let bad_trial = product(&[("free_trial_days", "-3")]);
        assert!(matches!(
            plan_from_provider_product(&existing, &bad_trial, &[]),
            Err(BillingError::InvalidProviderData(_))
        ));
    }

    #[tokio::test]
    async fn test_product_update_refreshes_plan() {
        let h = harness().await;
        h.provider.set_product(
            product(&[("features", r#"{"anonymous": true, "weighted": true}"#)]),
            vec![price(BillingPeriod::Monthly, 2500, true)],
        );

        let event = ProductUpdatedEvent {
            product_id: "prod_pro".into(),
        };
        assert_eq!(
            h.service.apply_product_updated(&event).await.unwrap(),
            ReconcileOutcome::Updated
        );

        let plan = h.store.get_plan(PRO_PLAN_ID).await.unwrap().unwrap();
        assert!(plan.features.anonymous);
        assert!(plan.features.weighted);
        assert_eq!(plan.monthly_price_cents, Some(2500));
    }

    #[tokio::test]
    async fn test_product_without_plan_is_noop() {
        let h = harness().await;
        let event = ProductUpdatedEvent {
            product_id: "prod_merch".into(),
        };
        assert_eq!(
            h.service.apply_product_updated(&event).await.unwrap(),
            ReconcileOutcome::Unchanged
        );
    }
}
