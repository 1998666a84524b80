//! Typed provider events
//!
//! Raw webhook JSON is parsed once, at the boundary, into one closed variant
//! per event family carrying only the fields the reconciler consumes. A
//! payload that fails validation never reaches business logic.

use std::collections::HashMap;

use serde::Deserialize;
use tally_shared::BillingPeriod;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Metadata key linking provider objects to an organization
pub const ORG_ADDRESS_METADATA_KEY: &str = "org_address";

pub const SUBSCRIPTION_CREATED: &str = "customer.subscription.created";
pub const SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
pub const SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";
pub const INVOICE_PAYMENT_SUCCEEDED: &str = "invoice.payment_succeeded";
pub const PRODUCT_UPDATED: &str = "product.updated";

/// A verified, validated provider event
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    pub created: i64,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Subscription(SubscriptionEvent),
    InvoicePaid(InvoicePaidEvent),
    ProductUpdated(ProductUpdatedEvent),
    /// A type this system chooses not to handle
    Unhandled,
}

impl EventKind {
    /// Organization the event mutates; `None` for global or unhandled events
    pub fn org_address(&self) -> Option<&str> {
        match self {
            EventKind::Subscription(sub) => Some(&sub.org_address),
            EventKind::InvoicePaid(invoice) => Some(&invoice.org_address),
            EventKind::ProductUpdated(_) | EventKind::Unhandled => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Unpaid,
    Incomplete,
    IncompleteExpired,
    Paused,
}

impl SubscriptionStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(SubscriptionStatus::Active),
            "trialing" => Some(SubscriptionStatus::Trialing),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "canceled" => Some(SubscriptionStatus::Canceled),
            "unpaid" => Some(SubscriptionStatus::Unpaid),
            "incomplete" => Some(SubscriptionStatus::Incomplete),
            "incomplete_expired" => Some(SubscriptionStatus::IncompleteExpired),
            "paused" => Some(SubscriptionStatus::Paused),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Paused => "paused",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Customer reference; email and metadata are present when Stripe expanded it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerRef {
    pub id: String,
    pub email: Option<String>,
    pub metadata: Option<HashMap<String, String>>,
}

/// `customer.subscription.{created,updated,deleted}`
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionEvent {
    pub subscription_id: String,
    pub customer: CustomerRef,
    pub status: SubscriptionStatus,
    pub product_id: String,
    pub billing_period: BillingPeriod,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub org_address: String,
}

/// `invoice.payment_succeeded`
#[derive(Debug, Clone, PartialEq)]
pub struct InvoicePaidEvent {
    pub invoice_id: String,
    pub org_address: String,
    pub effective_at: OffsetDateTime,
}

/// `product.updated`
#[derive(Debug, Clone, PartialEq)]
pub struct ProductUpdatedEvent {
    pub product_id: String,
}

// ============ RAW PAYLOAD SHAPES ============

#[derive(Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    created: i64,
    data: RawEventData,
}

#[derive(Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawExpandable<T> {
    Id(String),
    Object(T),
}

#[derive(Deserialize)]
struct RawCustomer {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct RawProductRef {
    id: String,
}

#[derive(Deserialize)]
struct RawRecurring {
    interval: String,
}

#[derive(Deserialize)]
struct RawPrice {
    product: RawExpandable<RawProductRef>,
    #[serde(default)]
    recurring: Option<RawRecurring>,
}

#[derive(Deserialize)]
struct RawSubscriptionItem {
    #[serde(default)]
    price: Option<RawPrice>,
    #[serde(default)]
    current_period_start: Option<i64>,
    #[serde(default)]
    current_period_end: Option<i64>,
}

#[derive(Deserialize)]
struct RawList<T> {
    data: Vec<T>,
}

#[derive(Deserialize)]
struct RawSubscription {
    id: String,
    status: String,
    customer: RawExpandable<RawCustomer>,
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
    #[serde(default)]
    current_period_start: Option<i64>,
    #[serde(default)]
    current_period_end: Option<i64>,
    items: RawList<RawSubscriptionItem>,
}

#[derive(Deserialize)]
struct RawSubscriptionDetails {
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct RawInvoiceParent {
    #[serde(default)]
    subscription_details: Option<RawSubscriptionDetails>,
}

#[derive(Deserialize)]
struct RawInvoice {
    id: String,
    #[serde(default)]
    effective_at: Option<i64>,
    #[serde(default)]
    subscription_details: Option<RawSubscriptionDetails>,
    #[serde(default)]
    parent: Option<RawInvoiceParent>,
}

// ============ PARSING ============

/// Parse an already-authenticated payload into a typed event
pub fn parse_event(payload: &[u8]) -> BillingResult<WebhookEvent> {
    let raw: RawEvent = serde_json::from_slice(payload).map_err(|e| {
        tracing::warn!(parse_error = %e, "Failed to parse webhook event JSON");
        BillingError::InvalidEvent("malformed event payload".to_string())
    })?;

    let kind = match raw.event_type.as_str() {
        SUBSCRIPTION_CREATED | SUBSCRIPTION_UPDATED | SUBSCRIPTION_DELETED => {
            EventKind::Subscription(parse_subscription(raw.data.object)?)
        }
        INVOICE_PAYMENT_SUCCEEDED => EventKind::InvoicePaid(parse_invoice(raw.data.object)?),
        PRODUCT_UPDATED => EventKind::ProductUpdated(parse_product(raw.data.object)?),
        _ => EventKind::Unhandled,
    };

    Ok(WebhookEvent {
        id: raw.id,
        event_type: raw.event_type,
        created: raw.created,
        kind,
    })
}

fn object_as<T: serde::de::DeserializeOwned>(
    object: serde_json::Value,
    what: &str,
) -> BillingResult<T> {
    serde_json::from_value(object)
        .map_err(|e| BillingError::InvalidEvent(format!("malformed {} object: {}", what, e)))
}

fn timestamp(value: Option<i64>, field: &str) -> BillingResult<OffsetDateTime> {
    let value = value.ok_or_else(|| BillingError::InvalidEvent(format!("missing {}", field)))?;
    OffsetDateTime::from_unix_timestamp(value)
        .map_err(|_| BillingError::InvalidEvent(format!("{} out of range: {}", field, value)))
}

fn org_address_from(
    metadata: Option<&HashMap<String, String>>,
    source: &str,
) -> BillingResult<String> {
    metadata
        .and_then(|m| m.get(ORG_ADDRESS_METADATA_KEY))
        .map(|address| address.trim())
        .filter(|address| !address.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            BillingError::InvalidEvent(format!(
                "{} not found in {} metadata",
                ORG_ADDRESS_METADATA_KEY, source
            ))
        })
}

fn parse_subscription(object: serde_json::Value) -> BillingResult<SubscriptionEvent> {
    let raw: RawSubscription = object_as(object, "subscription")?;

    let status = SubscriptionStatus::parse(&raw.status)
        .ok_or_else(|| {
            BillingError::InvalidEvent(format!("unknown subscription status: {}", raw.status))
        })?;

    let item = raw
        .items
        .data
        .first()
        .ok_or_else(|| BillingError::InvalidEvent("subscription has no items".to_string()))?;
    let price = item
        .price
        .as_ref()
        .ok_or_else(|| BillingError::InvalidEvent("subscription item has no price".to_string()))?;

    let product_id = match &price.product {
        RawExpandable::Id(id) => id.clone(),
        RawExpandable::Object(product) => product.id.clone(),
    };

    let interval = price
        .recurring
        .as_ref()
        .map(|r| r.interval.as_str())
        .ok_or_else(|| BillingError::InvalidEvent("price is not recurring".to_string()))?;
    let billing_period = BillingPeriod::parse(interval)
        .ok_or_else(|| {
            BillingError::InvalidEvent(format!("unsupported billing interval: {}", interval))
        })?;

    // Newer API versions moved the period bounds onto the items
    let current_period_start = timestamp(
        raw.current_period_start.or(item.current_period_start),
        "current_period_start",
    )?;
    let current_period_end = timestamp(
        raw.current_period_end.or(item.current_period_end),
        "current_period_end",
    )?;

    let org_address = org_address_from(raw.metadata.as_ref(), "subscription")?;

    let customer = match raw.customer {
        RawExpandable::Id(id) => CustomerRef {
            id,
            email: None,
            metadata: None,
        },
        RawExpandable::Object(c) => CustomerRef {
            id: c.id,
            email: c.email,
            metadata: Some(c.metadata.unwrap_or_default()),
        },
    };

    Ok(SubscriptionEvent {
        subscription_id: raw.id,
        customer,
        status,
        product_id,
        billing_period,
        current_period_start,
        current_period_end,
        org_address,
    })
}

fn parse_invoice(object: serde_json::Value) -> BillingResult<InvoicePaidEvent> {
    let raw: RawInvoice = object_as(object, "invoice")?;

    let effective_at = timestamp(raw.effective_at, "effective_at")?;

    let metadata = raw
        .subscription_details
        .as_ref()
        .and_then(|d| d.metadata.as_ref())
        .or_else(|| {
            raw.parent
                .as_ref()
                .and_then(|p| p.subscription_details.as_ref())
                .and_then(|d| d.metadata.as_ref())
        });
    let org_address = org_address_from(metadata, "invoice subscription_details")?;

    Ok(InvoicePaidEvent {
        invoice_id: raw.id,
        org_address,
        effective_at,
    })
}

fn parse_product(object: serde_json::Value) -> BillingResult<ProductUpdatedEvent> {
    let raw: RawProductRef = object_as(object, "product")?;
    Ok(ProductUpdatedEvent { product_id: raw.id })
}
