#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Tally Shared Types
//!
//! Domain model of billed organizations, the plan catalog and usage
//! snapshots, plus the storage contract and its adapters.

pub mod db;
pub mod memory;
pub mod store;
pub mod types;

pub use db::{create_pool, run_migrations, PgStore};
pub use memory::MemoryStore;
pub use store::{BillingStore, StoreError, StoreResult};
pub use types::{
    BillingPeriod, Organization, OrganizationSubscription, Plan, PlanFeatures, PlanLimits,
    UsageCounters, UsageSnapshot, UserRole, NO_PLAN,
};
