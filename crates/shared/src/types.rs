//! Domain types shared by the billing core and its storage adapters

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Plan identifier meaning "no plan assigned"
pub const NO_PLAN: i64 = 0;

/// Billing cadence of a subscription
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingPeriod {
    #[default]
    Monthly,
    Annual,
}

impl BillingPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingPeriod::Monthly => "monthly",
            BillingPeriod::Annual => "annual",
        }
    }

    /// Parse a stored value or a provider recurring interval (`month`/`year`)
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "monthly" | "month" => Some(BillingPeriod::Monthly),
            "annual" | "year" | "yearly" => Some(BillingPeriod::Annual),
            _ => None,
        }
    }
}

impl std::fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Role a user holds inside an organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Manager,
    Viewer,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::Manager => "manager",
            UserRole::Viewer => "viewer",
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, UserRole::Admin)
    }

    /// Admins and managers may operate on existing processes
    pub fn can_manage(&self) -> bool {
        matches!(self, UserRole::Admin | UserRole::Manager)
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Subscription record embedded in an organization
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationSubscription {
    /// Plan identifier, `NO_PLAN` when the organization was never subscribed
    pub plan_id: i64,
    /// Provider subscription identifier, empty on the default plan
    pub provider_subscription_id: String,
    pub billing_period: BillingPeriod,
    pub start_date: Option<OffsetDateTime>,
    pub renewal_date: Option<OffsetDateTime>,
    pub last_payment_date: Option<OffsetDateTime>,
    pub active: bool,
    pub email: String,
}

impl OrganizationSubscription {
    pub fn has_plan(&self) -> bool {
        self.plan_id != NO_PLAN
    }

    pub fn has_provider_subscription(&self) -> bool {
        !self.provider_subscription_id.is_empty()
    }
}

/// Lifetime usage counters. They only grow; period usage is derived from them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub processes: i64,
    pub sent_emails: i64,
    pub sent_sms: i64,
}

impl UsageCounters {
    pub fn new(processes: i64, sent_emails: i64, sent_sms: i64) -> Self {
        Self {
            processes,
            sent_emails,
            sent_sms,
        }
    }

    /// Component-wise `self - baseline`, never below zero
    pub fn since(&self, baseline: &UsageCounters) -> UsageCounters {
        UsageCounters {
            processes: (self.processes - baseline.processes).max(0),
            sent_emails: (self.sent_emails - baseline.sent_emails).max(0),
            sent_sms: (self.sent_sms - baseline.sent_sms).max(0),
        }
    }
}

/// A billed tenant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    /// Unique organization address
    pub address: String,
    pub subscription: OrganizationSubscription,
    pub counters: UsageCounters,
}

impl Organization {
    /// A freshly provisioned organization, not pointing at any plan
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }
}

/// Usage limits of a plan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlanLimits {
    pub max_processes: i64,
    pub max_census: i64,
    pub max_drafts: i64,
    pub max_sent_emails: i64,
    pub max_sent_sms: i64,
    /// Maximum process duration in days
    pub max_duration_days: i64,
    pub max_sub_orgs: i64,
    pub max_users: i64,
}

/// Feature flags of a plan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlanFeatures {
    pub anonymous: bool,
    pub overwrite: bool,
    pub weighted: bool,
    pub personalization: bool,
    pub email_reminder: bool,
    pub two_factor_email: bool,
    pub two_factor_sms: bool,
}

/// Catalog entry defining limits and features of a subscription tier
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: i64,
    pub name: String,
    pub provider_product_id: String,
    pub monthly_price_cents: Option<i64>,
    pub yearly_price_cents: Option<i64>,
    pub is_default: bool,
    pub free_trial_days: i64,
    pub limits: PlanLimits,
    pub features: PlanFeatures,
}

/// Baseline of lifetime counters captured at the start of a billing period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub id: Uuid,
    pub org_address: String,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    pub billing_period: BillingPeriod,
    pub baseline: UsageCounters,
    pub created_at: OffsetDateTime,
}
