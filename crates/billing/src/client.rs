//! Payment provider collaborator
//!
//! The reconciler only talks to Stripe through [`PaymentProvider`], which
//! returns provider-neutral shapes. Every outbound call is bounded by the
//! configured request timeout.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use stripe::{
    Customer, CustomerId, IdOrCreate, ListPrices, Price, Product, ProductId, RecurringInterval,
    UpdateCustomer,
};
use tally_shared::BillingPeriod;

use crate::clock::{Clock, SystemClock};
use crate::config::StripeConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::{parse_event, WebhookEvent};
use crate::signature::verify_signature;

/// Customer as seen by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCustomer {
    pub id: String,
    pub email: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Product as seen by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProduct {
    pub id: String,
    pub name: String,
    pub active: bool,
    pub metadata: HashMap<String, String>,
}

/// A price attached to a product; `interval` is `None` for one-off prices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderPrice {
    pub id: String,
    pub active: bool,
    pub interval: Option<BillingPeriod>,
    pub unit_amount: Option<i64>,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync + 'static {
    /// Authenticate a raw webhook and parse it into a typed event
    fn verify_and_parse_event(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> BillingResult<WebhookEvent>;

    async fn get_customer(&self, customer_id: &str) -> BillingResult<ProviderCustomer>;

    /// Replace the customer's metadata with `metadata`
    async fn update_customer_metadata(
        &self,
        customer_id: &str,
        metadata: HashMap<String, String>,
    ) -> BillingResult<()>;

    async fn get_product(&self, product_id: &str) -> BillingResult<ProviderProduct>;

    async fn get_product_prices(&self, product_id: &str) -> BillingResult<Vec<ProviderPrice>>;
}

/// Verify the signature header, then parse the payload
pub fn construct_event(
    payload: &[u8],
    signature: &str,
    secret: &str,
    tolerance_secs: i64,
    now_unix: i64,
) -> BillingResult<WebhookEvent> {
    verify_signature(payload, signature, secret, tolerance_secs, now_unix)?;
    parse_event(payload)
}

/// Stripe-backed provider
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: StripeConfig,
    clock: Arc<dyn Clock>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self {
            inner,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for webhook timestamp tolerance
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    async fn bounded<T, F>(&self, operation: &'static str, call: F) -> BillingResult<T>
    where
        F: Future<Output = Result<T, stripe::StripeError>> + Send,
    {
        match tokio::time::timeout(self.config.request_timeout, call).await {
            Ok(result) => result.map_err(BillingError::from),
            Err(_) => {
                tracing::warn!(
                    operation,
                    timeout_secs = self.config.request_timeout.as_secs(),
                    "Stripe call timed out"
                );
                Err(BillingError::ProviderTimeout(operation.to_string()))
            }
        }
    }
}

fn parse_customer_id(customer_id: &str) -> BillingResult<CustomerId> {
    customer_id.parse().map_err(|_| {
        BillingError::InvalidProviderData(format!("invalid customer id: {}", customer_id))
    })
}

fn parse_product_id(product_id: &str) -> BillingResult<ProductId> {
    product_id.parse().map_err(|_| {
        BillingError::InvalidProviderData(format!("invalid product id: {}", product_id))
    })
}

#[async_trait]
impl PaymentProvider for StripeClient {
    fn verify_and_parse_event(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> BillingResult<WebhookEvent> {
        construct_event(
            payload,
            signature,
            &self.config.webhook_secret,
            self.config.webhook_tolerance_secs,
            self.clock.now().unix_timestamp(),
        )
    }

    async fn get_customer(&self, customer_id: &str) -> BillingResult<ProviderCustomer> {
        let id = parse_customer_id(customer_id)?;
        let customer = self
            .bounded("get_customer", Customer::retrieve(&self.inner, &id, &[]))
            .await?;

        Ok(ProviderCustomer {
            id: customer.id.to_string(),
            email: customer.email,
            metadata: customer.metadata.unwrap_or_default(),
        })
    }

    async fn update_customer_metadata(
        &self,
        customer_id: &str,
        metadata: HashMap<String, String>,
    ) -> BillingResult<()> {
        let id = parse_customer_id(customer_id)?;
        let mut params = UpdateCustomer::new();
        params.metadata = Some(metadata);

        self.bounded(
            "update_customer_metadata",
            Customer::update(&self.inner, &id, params),
        )
        .await?;
        Ok(())
    }

    async fn get_product(&self, product_id: &str) -> BillingResult<ProviderProduct> {
        let id = parse_product_id(product_id)?;
        let product = self
            .bounded("get_product", Product::retrieve(&self.inner, &id, &[]))
            .await?;

        Ok(ProviderProduct {
            id: product.id.to_string(),
            name: product.name.unwrap_or_default(),
            active: product.active.unwrap_or(false),
            metadata: product.metadata.unwrap_or_default(),
        })
    }

    async fn get_product_prices(&self, product_id: &str) -> BillingResult<Vec<ProviderPrice>> {
        let mut params = ListPrices::new();
        params.product = Some(IdOrCreate::Id(product_id));
        params.active = Some(true);

        let prices = self
            .bounded("get_product_prices", Price::list(&self.inner, &params))
            .await?;

        Ok(prices
            .data
            .into_iter()
            .map(|price| ProviderPrice {
                id: price.id.to_string(),
                active: price.active.unwrap_or(false),
                interval: price.recurring.as_ref().and_then(|r| match r.interval {
                    RecurringInterval::Month => Some(BillingPeriod::Monthly),
                    RecurringInterval::Year => Some(BillingPeriod::Annual),
                    _ => None,
                }),
                unit_amount: price.unit_amount,
            })
            .collect())
    }
}
