//! Fixtures shared by unit and scenario tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use tally_shared::{BillingPeriod, BillingStore, MemoryStore, Plan, PlanFeatures, PlanLimits};
use time::macros::datetime;
use time::OffsetDateTime;

use crate::client::{
    construct_event, PaymentProvider, ProviderCustomer, ProviderPrice, ProviderProduct,
};
use crate::clock::{Clock, FixedClock};
use crate::error::{BillingError, BillingResult};
use crate::events::{CustomerRef, SubscriptionEvent, SubscriptionStatus, WebhookEvent};
use crate::signature::sign_payload;

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const DEFAULT_PLAN_ID: i64 = 1;
pub const PRO_PLAN_ID: i64 = 2;
pub const PRO_PRODUCT_ID: &str = "prod_pro";
pub const PERIOD_START: OffsetDateTime = datetime!(2026-01-15 00:00 UTC);

pub fn default_plan() -> Plan {
    Plan {
        id: DEFAULT_PLAN_ID,
        name: "Free".into(),
        provider_product_id: "prod_free".into(),
        is_default: true,
        limits: PlanLimits {
            max_processes: 1,
            max_census: 50,
            max_drafts: 1,
            max_sent_emails: 0,
            max_sent_sms: 0,
            max_duration_days: 7,
            max_sub_orgs: 0,
            max_users: 1,
        },
        ..Default::default()
    }
}

pub fn pro_plan() -> Plan {
    Plan {
        id: PRO_PLAN_ID,
        name: "Pro".into(),
        provider_product_id: PRO_PRODUCT_ID.into(),
        monthly_price_cents: Some(4900),
        yearly_price_cents: Some(49000),
        free_trial_days: 14,
        limits: PlanLimits {
            max_processes: 10,
            max_census: 1000,
            max_drafts: 5,
            max_sent_emails: 500,
            max_sent_sms: 100,
            max_duration_days: 30,
            max_sub_orgs: 3,
            max_users: 10,
        },
        features: PlanFeatures {
            anonymous: true,
            overwrite: true,
            weighted: false,
            personalization: true,
            email_reminder: true,
            two_factor_email: true,
            two_factor_sms: true,
        },
        ..Default::default()
    }
}

pub async fn seed_catalog(store: &MemoryStore) {
    store.set_plan(&default_plan()).await.unwrap();
    store.set_plan(&pro_plan()).await.unwrap();
}

pub fn subscription_event(
    org_address: &str,
    subscription_id: &str,
    status: SubscriptionStatus,
    billing_period: BillingPeriod,
) -> SubscriptionEvent {
    let end = match billing_period {
        BillingPeriod::Monthly => datetime!(2026-02-15 00:00 UTC),
        BillingPeriod::Annual => datetime!(2027-01-15 00:00 UTC),
    };
    SubscriptionEvent {
        subscription_id: subscription_id.into(),
        customer: CustomerRef {
            id: format!("cus_{}", org_address),
            email: None,
            metadata: None,
        },
        status,
        product_id: PRO_PRODUCT_ID.into(),
        billing_period,
        current_period_start: PERIOD_START,
        current_period_end: end,
        org_address: org_address.into(),
    }
}

// ============ RAW PAYLOADS ============

pub fn subscription_payload(
    event_id: &str,
    org_address: &str,
    subscription_id: &str,
    status: &str,
    interval: &str,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
) -> Vec<u8> {
    json!({
        "id": event_id,
        "type": "customer.subscription.updated",
        "created": period_start.unix_timestamp(),
        "data": { "object": {
            "id": subscription_id,
            "status": status,
            "customer": format!("cus_{}", org_address),
            "metadata": { "org_address": org_address },
            "current_period_start": period_start.unix_timestamp(),
            "current_period_end": period_end.unix_timestamp(),
            "items": { "data": [{
                "price": { "product": PRO_PRODUCT_ID, "recurring": { "interval": interval } }
            }]}
        }}
    })
    .to_string()
    .into_bytes()
}

pub fn invoice_payload(event_id: &str, org_address: &str, effective_at: OffsetDateTime) -> Vec<u8> {
    json!({
        "id": event_id,
        "type": "invoice.payment_succeeded",
        "data": { "object": {
            "id": format!("in_{}", event_id),
            "effective_at": effective_at.unix_timestamp(),
            "subscription_details": { "metadata": { "org_address": org_address } }
        }}
    })
    .to_string()
    .into_bytes()
}

pub fn product_payload(event_id: &str, product_id: &str) -> Vec<u8> {
    json!({
        "id": event_id,
        "type": "product.updated",
        "data": { "object": { "id": product_id, "name": "Pro" } }
    })
    .to_string()
    .into_bytes()
}

pub fn unhandled_payload(event_id: &str) -> Vec<u8> {
    json!({
        "id": event_id,
        "type": "charge.dispute.created",
        "data": { "object": { "id": "dp_1" } }
    })
    .to_string()
    .into_bytes()
}

// ============ FAKE PROVIDER ============

/// In-process provider that verifies real signatures and keeps its catalog in maps
pub struct FakeProvider {
    clock: Arc<FixedClock>,
    customers: DashMap<String, ProviderCustomer>,
    products: DashMap<String, (ProviderProduct, Vec<ProviderPrice>)>,
    fail_metadata_updates: AtomicBool,
    metadata_updates: AtomicUsize,
    fail_product_fetches: AtomicBool,
    product_fetches_in_flight: AtomicUsize,
    max_product_fetches_in_flight: AtomicUsize,
}

impl FakeProvider {
    pub fn new(clock: Arc<FixedClock>) -> Self {
        Self {
            clock,
            customers: DashMap::new(),
            products: DashMap::new(),
            fail_metadata_updates: AtomicBool::new(false),
            metadata_updates: AtomicUsize::new(0),
            fail_product_fetches: AtomicBool::new(false),
            product_fetches_in_flight: AtomicUsize::new(0),
            max_product_fetches_in_flight: AtomicUsize::new(0),
        }
    }

    /// Sign `payload` as the provider would at the current clock time
    pub fn sign(&self, payload: &[u8]) -> String {
        sign_payload(payload, WEBHOOK_SECRET, self.clock.now().unix_timestamp()).unwrap()
    }

    pub fn add_customer(&self, id: &str, email: Option<&str>) {
        self.customers.insert(
            id.to_string(),
            ProviderCustomer {
                id: id.to_string(),
                email: email.map(str::to_string),
                metadata: HashMap::new(),
            },
        );
    }

    pub fn customer(&self, id: &str) -> Option<ProviderCustomer> {
        self.customers.get(id).map(|c| c.value().clone())
    }

    pub fn set_product(&self, product: ProviderProduct, prices: Vec<ProviderPrice>) {
        self.products.insert(product.id.clone(), (product, prices));
    }

    pub fn fail_metadata_updates(&self, fail: bool) {
        self.fail_metadata_updates.store(fail, Ordering::SeqCst);
    }

    pub fn metadata_update_count(&self) -> usize {
        self.metadata_updates.load(Ordering::SeqCst)
    }

    pub fn fail_product_fetches(&self, fail: bool) {
        self.fail_product_fetches.store(fail, Ordering::SeqCst);
    }

    /// Highest number of `get_product` calls observed running at once
    pub fn max_concurrent_product_fetches(&self) -> usize {
        self.max_product_fetches_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    fn verify_and_parse_event(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> BillingResult<WebhookEvent> {
        construct_event(
            payload,
            signature,
            WEBHOOK_SECRET,
            300,
            self.clock.now().unix_timestamp(),
        )
    }

    async fn get_customer(&self, customer_id: &str) -> BillingResult<ProviderCustomer> {
        self.customer(customer_id)
            .ok_or_else(|| BillingError::StripeApi(format!("No such customer: {}", customer_id)))
    }

    async fn update_customer_metadata(
        &self,
        customer_id: &str,
        metadata: HashMap<String, String>,
    ) -> BillingResult<()> {
        if self.fail_metadata_updates.load(Ordering::SeqCst) {
            return Err(BillingError::ProviderTimeout("update_customer_metadata".into()));
        }
        let mut customer = self
            .customers
            .get_mut(customer_id)
            .ok_or_else(|| BillingError::StripeApi(format!("No such customer: {}", customer_id)))?;
        customer.metadata.extend(metadata);
        self.metadata_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_product(&self, product_id: &str) -> BillingResult<ProviderProduct> {
        if self.fail_product_fetches.load(Ordering::SeqCst) {
            return Err(BillingError::ProviderTimeout("get_product".into()));
        }

        let in_flight = self.product_fetches_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_product_fetches_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        self.product_fetches_in_flight.fetch_sub(1, Ordering::SeqCst);

        self.products
            .get(product_id)
            .map(|entry| entry.value().0.clone())
            .ok_or_else(|| BillingError::StripeApi(format!("No such product: {}", product_id)))
    }

    async fn get_product_prices(&self, product_id: &str) -> BillingResult<Vec<ProviderPrice>> {
        Ok(self
            .products
            .get(product_id)
            .map(|entry| entry.value().1.clone())
            .unwrap_or_default())
    }
}
