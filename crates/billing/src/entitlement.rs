//! Quota and permission decisions
//!
//! [`evaluate_tx`] and [`evaluate_quota`] are pure: same inputs, same answer.
//! [`EntitlementService`] gathers the inputs (organization, plan, period usage,
//! externally counted resources) and delegates to them.
//!
//! Denials are values, not errors. Errors are reserved for lookups that
//! failed; a missing plan is never read as "no limit".

use std::sync::Arc;

use tally_shared::{
    BillingStore, Organization, OrganizationSubscription, Plan, UsageCounters, UserRole,
};

use crate::error::{BillingError, BillingResult};
use crate::usage::UsageMeter;

/// Requested shape of a new voting process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NewProcessTx {
    pub census_size: i64,
    pub duration_days: i64,
    pub anonymous: bool,
    pub weighted: bool,
    pub vote_overwrite: bool,
}

/// Transaction an organization member wants to submit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxRequest {
    NewProcess(NewProcessTx),
    SetProcessCensus { census_size: i64 },
    SetProcessDuration { duration_days: i64 },
    SetProcessStatus,
    AddDelegate,
    DelDelegate,
}

impl TxRequest {
    pub fn name(&self) -> &'static str {
        match self {
            TxRequest::NewProcess(_) => "new_process",
            TxRequest::SetProcessCensus { .. } => "set_process_census",
            TxRequest::SetProcessDuration { .. } => "set_process_duration",
            TxRequest::SetProcessStatus => "set_process_status",
            TxRequest::AddDelegate => "add_delegate",
            TxRequest::DelDelegate => "del_delegate",
        }
    }

    fn needs_usage(&self) -> bool {
        matches!(self, TxRequest::NewProcess(_))
    }
}

/// Metered action outside of process transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaAction {
    CreateDraft,
    InviteUser,
    DeleteUser,
    CreateSubOrg,
    PublishCensus {
        census_size: i64,
        two_factor_email: bool,
        two_factor_sms: bool,
    },
}

impl QuotaAction {
    pub fn name(&self) -> &'static str {
        match self {
            QuotaAction::CreateDraft => "create_draft",
            QuotaAction::InviteUser => "invite_user",
            QuotaAction::DeleteUser => "delete_user",
            QuotaAction::CreateSubOrg => "create_sub_org",
            QuotaAction::PublishCensus { .. } => "publish_census",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    Anonymous,
    Weighted,
    VoteOverwrite,
    TwoFactorEmail,
    TwoFactorSms,
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Feature::Anonymous => write!(f, "anonymous voting"),
            Feature::Weighted => write!(f, "weighted voting"),
            Feature::VoteOverwrite => write!(f, "vote overwrite"),
            Feature::TwoFactorEmail => write!(f, "two-factor email"),
            Feature::TwoFactorSms => write!(f, "two-factor SMS"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allowance {
    Emails,
    Sms,
}

impl std::fmt::Display for Allowance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Allowance::Emails => write!(f, "email"),
            Allowance::Sms => write!(f, "SMS"),
        }
    }
}

/// Why an action was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DenialReason {
    #[error("Organization has no subscription")]
    NoSubscription,

    #[error("Subscription is not active")]
    SubscriptionInactive,

    #[error("Role {role} is not allowed to {action}")]
    RoleNotAllowed { role: UserRole, action: &'static str },

    #[error("Census size {requested} exceeds the plan limit of {limit}")]
    CensusTooLarge { requested: i64, limit: i64 },

    #[error("Process limit reached ({used} of {limit})")]
    ProcessLimitReached { used: i64, limit: i64 },

    #[error("Plan does not include {0}")]
    FeatureNotEnabled(Feature),

    #[error("Duration of {requested} days exceeds the plan limit of {limit} days")]
    DurationTooLong { requested: i64, limit: i64 },

    #[error("Draft limit reached ({count} of {limit})")]
    DraftLimitReached { count: i64, limit: i64 },

    #[error("User limit reached ({count} of {limit})")]
    UserLimitReached { count: i64, limit: i64 },

    #[error("Sub-organization limit reached ({count} of {limit})")]
    SubOrgLimitReached { count: i64, limit: i64 },

    #[error("Not enough {resource} allowance: {remaining} remaining, {requested} requested")]
    InsufficientAllowance {
        resource: Allowance,
        remaining: i64,
        requested: i64,
    },
}

/// Outcome of a permission or quota check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Permission {
    Allowed,
    Denied(DenialReason),
}

impl Permission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Permission::Allowed)
    }

    pub fn denial(&self) -> Option<&DenialReason> {
        match self {
            Permission::Allowed => None,
            Permission::Denied(reason) => Some(reason),
        }
    }

    /// `Ok(())` when allowed, the reason otherwise
    pub fn into_result(self) -> Result<(), DenialReason> {
        match self {
            Permission::Allowed => Ok(()),
            Permission::Denied(reason) => Err(reason),
        }
    }
}

impl From<Result<(), DenialReason>> for Permission {
    fn from(result: Result<(), DenialReason>) -> Self {
        match result {
            Ok(()) => Permission::Allowed,
            Err(reason) => Permission::Denied(reason),
        }
    }
}

/// Everything a decision depends on besides the request itself
#[derive(Debug, Clone, Copy)]
pub struct DecisionInput<'a> {
    pub role: UserRole,
    pub subscription: &'a OrganizationSubscription,
    pub plan: &'a Plan,
    /// Period usage for annual plans, lifetime counters otherwise
    pub usage: UsageCounters,
    /// Census size that may always start a process, even past the process limit
    pub test_census_allowance: i64,
}

/// Denial that applies before any plan is looked at
pub fn subscription_gate(subscription: &OrganizationSubscription) -> Result<(), DenialReason> {
    if !subscription.has_plan() {
        return Err(DenialReason::NoSubscription);
    }
    if !subscription.active {
        return Err(DenialReason::SubscriptionInactive);
    }
    Ok(())
}

fn require_admin(role: UserRole, action: &'static str) -> Result<(), DenialReason> {
    if role.is_admin() {
        Ok(())
    } else {
        Err(DenialReason::RoleNotAllowed { role, action })
    }
}

fn require_manager(role: UserRole, action: &'static str) -> Result<(), DenialReason> {
    if role.can_manage() {
        Ok(())
    } else {
        Err(DenialReason::RoleNotAllowed { role, action })
    }
}

fn require_feature(requested: bool, enabled: bool, feature: Feature) -> Result<(), DenialReason> {
    if requested && !enabled {
        Err(DenialReason::FeatureNotEnabled(feature))
    } else {
        Ok(())
    }
}

fn check_census(requested: i64, plan: &Plan) -> Result<(), DenialReason> {
    if requested > plan.limits.max_census {
        return Err(DenialReason::CensusTooLarge {
            requested,
            limit: plan.limits.max_census,
        });
    }
    Ok(())
}

fn check_duration(requested: i64, plan: &Plan) -> Result<(), DenialReason> {
    if requested > plan.limits.max_duration_days {
        return Err(DenialReason::DurationTooLong {
            requested,
            limit: plan.limits.max_duration_days,
        });
    }
    Ok(())
}

fn check_allowance(
    resource: Allowance,
    limit: i64,
    used: i64,
    requested: i64,
) -> Result<(), DenialReason> {
    let remaining = (limit - used).max(0);
    if remaining < requested {
        return Err(DenialReason::InsufficientAllowance {
            resource,
            remaining,
            requested,
        });
    }
    Ok(())
}

fn decide_tx(input: &DecisionInput<'_>, tx: &TxRequest) -> Result<(), DenialReason> {
    subscription_gate(input.subscription)?;
    let plan = input.plan;
    let action = tx.name();

    match tx {
        TxRequest::NewProcess(process) => {
            require_admin(input.role, action)?;
            check_census(process.census_size, plan)?;

            let used = input.usage.processes;
            let over_limit = used >= plan.limits.max_processes;
            if over_limit && process.census_size > input.test_census_allowance {
                return Err(DenialReason::ProcessLimitReached {
                    used,
                    limit: plan.limits.max_processes,
                });
            }

            require_feature(process.anonymous, plan.features.anonymous, Feature::Anonymous)?;
            require_feature(process.weighted, plan.features.weighted, Feature::Weighted)?;
            require_feature(
                process.vote_overwrite,
                plan.features.overwrite,
                Feature::VoteOverwrite,
            )?;
            check_duration(process.duration_days, plan)
        }
        TxRequest::SetProcessCensus { census_size } => {
            require_manager(input.role, action)?;
            check_census(*census_size, plan)
        }
        TxRequest::SetProcessDuration { duration_days } => {
            require_manager(input.role, action)?;
            check_duration(*duration_days, plan)
        }
        TxRequest::SetProcessStatus => require_manager(input.role, action),
        TxRequest::AddDelegate | TxRequest::DelDelegate => require_admin(input.role, action),
    }
}

/// Decide whether `tx` may be submitted
pub fn evaluate_tx(input: &DecisionInput<'_>, tx: &TxRequest) -> Permission {
    decide_tx(input, tx).into()
}

fn decide_quota(
    input: &DecisionInput<'_>,
    action: &QuotaAction,
    current_count: i64,
) -> Result<(), DenialReason> {
    subscription_gate(input.subscription)?;
    let limits = &input.plan.limits;
    let features = &input.plan.features;
    let name = action.name();

    match action {
        QuotaAction::CreateDraft => {
            require_manager(input.role, name)?;
            if current_count >= limits.max_drafts {
                return Err(DenialReason::DraftLimitReached {
                    count: current_count,
                    limit: limits.max_drafts,
                });
            }
            Ok(())
        }
        QuotaAction::InviteUser => {
            require_admin(input.role, name)?;
            if current_count >= limits.max_users {
                return Err(DenialReason::UserLimitReached {
                    count: current_count,
                    limit: limits.max_users,
                });
            }
            Ok(())
        }
        QuotaAction::DeleteUser => require_admin(input.role, name),
        QuotaAction::CreateSubOrg => {
            require_admin(input.role, name)?;
            if current_count >= limits.max_sub_orgs {
                return Err(DenialReason::SubOrgLimitReached {
                    count: current_count,
                    limit: limits.max_sub_orgs,
                });
            }
            Ok(())
        }
        QuotaAction::PublishCensus {
            census_size,
            two_factor_email,
            two_factor_sms,
        } => {
            require_manager(input.role, name)?;
            check_census(*census_size, input.plan)?;
            if *two_factor_email {
                require_feature(true, features.two_factor_email, Feature::TwoFactorEmail)?;
                check_allowance(
                    Allowance::Emails,
                    limits.max_sent_emails,
                    input.usage.sent_emails,
                    *census_size,
                )?;
            }
            if *two_factor_sms {
                require_feature(true, features.two_factor_sms, Feature::TwoFactorSms)?;
                check_allowance(
                    Allowance::Sms,
                    limits.max_sent_sms,
                    input.usage.sent_sms,
                    *census_size,
                )?;
            }
            Ok(())
        }
    }
}

/// Decide whether `action` fits the plan.
///
/// `current_count` is the externally counted resource the action grows:
/// drafts, members or sub-organizations. It is ignored for other actions.
pub fn evaluate_quota(
    input: &DecisionInput<'_>,
    action: &QuotaAction,
    current_count: i64,
) -> Permission {
    decide_quota(input, action, current_count).into()
}

pub struct EntitlementService {
    store: Arc<dyn BillingStore>,
    usage: Arc<UsageMeter>,
    test_census_allowance: i64,
}

impl EntitlementService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        usage: Arc<UsageMeter>,
        test_census_allowance: i64,
    ) -> Self {
        Self {
            store,
            usage,
            test_census_allowance,
        }
    }

    async fn load(&self, org_address: &str) -> BillingResult<Organization> {
        self.store
            .get_organization(org_address)
            .await?
            .ok_or_else(|| BillingError::OrganizationNotFound(org_address.to_string()))
    }

    async fn load_plan(&self, org: &Organization) -> BillingResult<Plan> {
        let plan_id = org.subscription.plan_id;
        self.store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| {
                BillingError::PlanNotFound(format!("plan {} of {}", plan_id, org.address))
            })
    }

    fn log_decision(org_address: &str, role: UserRole, action: &str, permission: &Permission) {
        if let Some(reason) = permission.denial() {
            tracing::info!(
                org_address = %org_address,
                role = %role,
                action,
                reason = %reason,
                "Action denied"
            );
        }
    }

    /// Check whether `role` in `org_address` may submit `tx`
    pub async fn check_tx_permission(
        &self,
        tx: &TxRequest,
        org_address: &str,
        role: UserRole,
    ) -> BillingResult<Permission> {
        let org = self.load(org_address).await?;
        if let Err(reason) = subscription_gate(&org.subscription) {
            let permission = Permission::Denied(reason);
            Self::log_decision(org_address, role, tx.name(), &permission);
            return Ok(permission);
        }

        let plan = self.load_plan(&org).await?;
        let usage = if tx.needs_usage() {
            self.usage.period_usage_for(&org).await?.counters
        } else {
            org.counters
        };

        let input = DecisionInput {
            role,
            subscription: &org.subscription,
            plan: &plan,
            usage,
            test_census_allowance: self.test_census_allowance,
        };
        let permission = evaluate_tx(&input, tx);
        Self::log_decision(org_address, role, tx.name(), &permission);
        Ok(permission)
    }

    /// Check whether `role` in `org_address` may perform `action`
    pub async fn check_quota(
        &self,
        org_address: &str,
        role: UserRole,
        action: &QuotaAction,
    ) -> BillingResult<Permission> {
        let org = self.load(org_address).await?;
        if let Err(reason) = subscription_gate(&org.subscription) {
            let permission = Permission::Denied(reason);
            Self::log_decision(org_address, role, action.name(), &permission);
            return Ok(permission);
        }

        let plan = self.load_plan(&org).await?;
        let (usage, current_count) = match action {
            QuotaAction::CreateDraft => (
                org.counters,
                self.store.count_draft_processes(org_address).await?,
            ),
            QuotaAction::InviteUser => (org.counters, self.store.count_members(org_address).await?),
            QuotaAction::CreateSubOrg => (
                org.counters,
                self.store.count_sub_organizations(org_address).await?,
            ),
            QuotaAction::PublishCensus { .. } => {
                (self.usage.period_usage_for(&org).await?.counters, 0)
            }
            QuotaAction::DeleteUser => (org.counters, 0),
        };

        let input = DecisionInput {
            role,
            subscription: &org.subscription,
            plan: &plan,
            usage,
            test_census_allowance: self.test_census_allowance,
        };
        let permission = evaluate_quota(&input, action, current_count);
        Self::log_decision(org_address, role, action.name(), &permission);
        Ok(permission)
    }
}
