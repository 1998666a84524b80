//! Persistence contract consumed by the billing core
//!
//! The core treats storage as an opaque document store. Implementations must
//! give read-your-writes consistency within one process.

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::types::{Organization, OrganizationSubscription, Plan, UsageSnapshot};

/// Storage failure
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
            other => StoreError::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait BillingStore: Send + Sync + 'static {
    async fn get_organization(&self, address: &str) -> StoreResult<Option<Organization>>;

    /// Insert or fully replace an organization
    async fn set_organization(&self, org: &Organization) -> StoreResult<()>;

    /// Replace the embedded subscription; `NotFound` when the organization is absent
    async fn set_organization_subscription(
        &self,
        address: &str,
        subscription: &OrganizationSubscription,
    ) -> StoreResult<()>;

    async fn list_organizations(&self) -> StoreResult<Vec<Organization>>;

    async fn get_plan(&self, plan_id: i64) -> StoreResult<Option<Plan>>;

    async fn get_plan_by_product_id(&self, product_id: &str) -> StoreResult<Option<Plan>>;

    async fn get_default_plan(&self) -> StoreResult<Option<Plan>>;

    /// Insert (id 0) or replace a plan, returning its identifier
    async fn set_plan(&self, plan: &Plan) -> StoreResult<i64>;

    async fn list_plans(&self) -> StoreResult<Vec<Plan>>;

    async fn get_usage_snapshot(
        &self,
        address: &str,
        period_start: OffsetDateTime,
    ) -> StoreResult<Option<UsageSnapshot>>;

    /// Store a snapshot keyed by `(org_address, period_start)` unless one exists.
    /// Returns the stored snapshot, which is the pre-existing one on conflict.
    async fn upsert_usage_snapshot(&self, snapshot: &UsageSnapshot) -> StoreResult<UsageSnapshot>;

    async fn count_draft_processes(&self, address: &str) -> StoreResult<i64>;

    async fn count_members(&self, address: &str) -> StoreResult<i64>;

    async fn count_sub_organizations(&self, address: &str) -> StoreResult<i64>;
}
