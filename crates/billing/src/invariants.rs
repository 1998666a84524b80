//! Billing Invariants Module
//!
//! Runnable consistency checks over the plan catalog and organization
//! subscriptions. They only read, and can be run after webhook replays or on
//! a schedule.
//!
//! Each violation carries the affected organizations and enough context to
//! investigate without re-running the query.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tally_shared::{BillingStore, Organization, Plan};
use time::OffsetDateTime;

use crate::error::BillingResult;

const SINGLE_DEFAULT_PLAN: &str = "single_default_plan";
const ORGANIZATIONS_REFERENCE_KNOWN_PLANS: &str = "organizations_reference_known_plans";
const DEFAULT_PLAN_HAS_NO_PROVIDER_SUBSCRIPTION: &str = "default_plan_has_no_provider_subscription";
const PAID_PLAN_HAS_PROVIDER_SUBSCRIPTION: &str = "paid_plan_has_provider_subscription";

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Organization(s) affected
    pub org_addresses: Vec<String>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Cancellations cannot be processed or limits cannot be resolved
    Critical,
    /// An organization gets the wrong limits
    High,
    /// Stale data that should be investigated
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    store: Arc<dyn BillingStore>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    async fn load(&self) -> BillingResult<(Vec<Plan>, Vec<Organization>)> {
        let plans = self.store.list_plans().await?;
        let orgs = self.store.list_organizations().await?;
        Ok((plans, orgs))
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let (plans, orgs) = self.load().await?;

        let mut violations = Vec::new();
        for name in Self::available_checks() {
            violations.extend(evaluate(name, &plans, &orgs));
        }

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        for violation in &violations {
            tracing::warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                org_count = violation.org_addresses.len(),
                description = %violation.description,
                "Billing invariant violated"
            );
        }

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        if !Self::available_checks().contains(&name) {
            return Ok(vec![]);
        }
        let (plans, orgs) = self.load().await?;
        Ok(evaluate(name, &plans, &orgs))
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            SINGLE_DEFAULT_PLAN,
            ORGANIZATIONS_REFERENCE_KNOWN_PLANS,
            DEFAULT_PLAN_HAS_NO_PROVIDER_SUBSCRIPTION,
            PAID_PLAN_HAS_PROVIDER_SUBSCRIPTION,
        ]
    }
}

fn evaluate(name: &str, plans: &[Plan], orgs: &[Organization]) -> Vec<InvariantViolation> {
    match name {
        SINGLE_DEFAULT_PLAN => check_single_default_plan(plans),
        ORGANIZATIONS_REFERENCE_KNOWN_PLANS => check_known_plans(plans, orgs),
        DEFAULT_PLAN_HAS_NO_PROVIDER_SUBSCRIPTION => check_default_plan_subscriptions(plans, orgs),
        PAID_PLAN_HAS_PROVIDER_SUBSCRIPTION => check_paid_plan_subscriptions(plans, orgs),
        _ => vec![],
    }
}

/// Exactly one default plan; cancellations have nowhere to go otherwise
fn check_single_default_plan(plans: &[Plan]) -> Vec<InvariantViolation> {
    let defaults: Vec<i64> = plans.iter().filter(|p| p.is_default).map(|p| p.id).collect();
    if defaults.len() == 1 {
        return vec![];
    }

    vec![InvariantViolation {
        invariant: SINGLE_DEFAULT_PLAN.to_string(),
        org_addresses: vec![],
        description: format!("Catalog has {} default plans (expected 1)", defaults.len()),
        context: serde_json::json!({ "default_plan_ids": defaults }),
        severity: ViolationSeverity::Critical,
    }]
}

/// Every assigned plan id resolves to a catalog entry
fn check_known_plans(plans: &[Plan], orgs: &[Organization]) -> Vec<InvariantViolation> {
    let known: HashSet<i64> = plans.iter().map(|p| p.id).collect();
    let mut dangling: HashMap<i64, Vec<String>> = HashMap::new();
    for org in orgs {
        let plan_id = org.subscription.plan_id;
        if org.subscription.has_plan() && !known.contains(&plan_id) {
            dangling.entry(plan_id).or_default().push(org.address.clone());
        }
    }

    let mut violations: Vec<InvariantViolation> = dangling
        .into_iter()
        .map(|(plan_id, org_addresses)| InvariantViolation {
            invariant: ORGANIZATIONS_REFERENCE_KNOWN_PLANS.to_string(),
            description: format!(
                "{} organization(s) reference missing plan {}",
                org_addresses.len(),
                plan_id
            ),
            context: serde_json::json!({ "plan_id": plan_id }),
            org_addresses,
            severity: ViolationSeverity::High,
        })
        .collect();
    violations.sort_by(|a, b| a.description.cmp(&b.description));
    violations
}

fn default_plan_ids(plans: &[Plan]) -> HashSet<i64> {
    plans.iter().filter(|p| p.is_default).map(|p| p.id).collect()
}

/// Default-plan organizations carry no live provider subscription
fn check_default_plan_subscriptions(
    plans: &[Plan],
    orgs: &[Organization],
) -> Vec<InvariantViolation> {
    let defaults = default_plan_ids(plans);
    let affected: Vec<&Organization> = orgs
        .iter()
        .filter(|o| defaults.contains(&o.subscription.plan_id))
        .filter(|o| o.subscription.has_provider_subscription())
        .collect();
    if affected.is_empty() {
        return vec![];
    }

    vec![InvariantViolation {
        invariant: DEFAULT_PLAN_HAS_NO_PROVIDER_SUBSCRIPTION.to_string(),
        org_addresses: affected.iter().map(|o| o.address.clone()).collect(),
        description: format!(
            "{} organization(s) on the default plan still reference a provider subscription",
            affected.len()
        ),
        context: serde_json::json!({
            "subscription_ids": affected
                .iter()
                .map(|o| o.subscription.provider_subscription_id.clone())
                .collect::<Vec<_>>(),
        }),
        severity: ViolationSeverity::Medium,
    }]
}

/// Active organizations on a paid plan are backed by a provider subscription
fn check_paid_plan_subscriptions(plans: &[Plan], orgs: &[Organization]) -> Vec<InvariantViolation> {
    let defaults = default_plan_ids(plans);
    let affected: Vec<&Organization> = orgs
        .iter()
        .filter(|o| o.subscription.active && o.subscription.has_plan())
        .filter(|o| !defaults.contains(&o.subscription.plan_id))
        .filter(|o| !o.subscription.has_provider_subscription())
        .collect();
    if affected.is_empty() {
        return vec![];
    }

    vec![InvariantViolation {
        invariant: PAID_PLAN_HAS_PROVIDER_SUBSCRIPTION.to_string(),
        org_addresses: affected.iter().map(|o| o.address.clone()).collect(),
        description: format!(
            "{} active organization(s) on a paid plan have no provider subscription",
            affected.len()
        ),
        context: serde_json::json!({
            "plan_ids": affected.iter().map(|o| o.subscription.plan_id).collect::<Vec<_>>(),
        }),
        severity: ViolationSeverity::High,
    }]
}
