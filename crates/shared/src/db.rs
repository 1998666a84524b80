//! Postgres storage adapter

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::store::{BillingStore, StoreError, StoreResult};
use crate::types::{
    BillingPeriod, Organization, OrganizationSubscription, Plan, PlanFeatures, PlanLimits,
    UsageCounters, UsageSnapshot,
};

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> StoreResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    tracing::info!("Database pool created");
    Ok(pool)
}

/// Apply the bundled schema migrations
pub async fn run_migrations(pool: &PgPool) -> StoreResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
    tracing::info!("Database migrations applied");
    Ok(())
}

#[derive(Debug, sqlx::FromRow)]
struct OrganizationRow {
    address: String,
    plan_id: i64,
    provider_subscription_id: String,
    billing_period: String,
    start_date: Option<OffsetDateTime>,
    renewal_date: Option<OffsetDateTime>,
    last_payment_date: Option<OffsetDateTime>,
    subscription_active: bool,
    billing_email: String,
    processes: i64,
    sent_emails: i64,
    sent_sms: i64,
}

impl From<OrganizationRow> for Organization {
    fn from(row: OrganizationRow) -> Self {
        Organization {
            address: row.address,
            subscription: OrganizationSubscription {
                plan_id: row.plan_id,
                provider_subscription_id: row.provider_subscription_id,
                billing_period: BillingPeriod::parse(&row.billing_period).unwrap_or_default(),
                start_date: row.start_date,
                renewal_date: row.renewal_date,
                last_payment_date: row.last_payment_date,
                active: row.subscription_active,
                email: row.billing_email,
            },
            counters: UsageCounters::new(row.processes, row.sent_emails, row.sent_sms),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PlanRow {
    id: i64,
    name: String,
    provider_product_id: String,
    monthly_price_cents: Option<i64>,
    yearly_price_cents: Option<i64>,
    is_default: bool,
    free_trial_days: i64,
    limits: Json<PlanLimits>,
    features: Json<PlanFeatures>,
}

impl From<PlanRow> for Plan {
    fn from(row: PlanRow) -> Self {
        Plan {
            id: row.id,
            name: row.name,
            provider_product_id: row.provider_product_id,
            monthly_price_cents: row.monthly_price_cents,
            yearly_price_cents: row.yearly_price_cents,
            is_default: row.is_default,
            free_trial_days: row.free_trial_days,
            limits: row.limits.0,
            features: row.features.0,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SnapshotRow {
    id: Uuid,
    org_address: String,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    billing_period: String,
    baseline_processes: i64,
    baseline_sent_emails: i64,
    baseline_sent_sms: i64,
    created_at: OffsetDateTime,
}

impl From<SnapshotRow> for UsageSnapshot {
    fn from(row: SnapshotRow) -> Self {
        UsageSnapshot {
            id: row.id,
            org_address: row.org_address,
            period_start: row.period_start,
            period_end: row.period_end,
            billing_period: BillingPeriod::parse(&row.billing_period).unwrap_or_default(),
            baseline: UsageCounters::new(
                row.baseline_processes,
                row.baseline_sent_emails,
                row.baseline_sent_sms,
            ),
            created_at: row.created_at,
        }
    }
}

const ORGANIZATION_COLUMNS: &str = r#"
    address, plan_id, provider_subscription_id, billing_period, start_date,
    renewal_date, last_payment_date, subscription_active, billing_email,
    processes, sent_emails, sent_sms
"#;

const PLAN_COLUMNS: &str = r#"
    id, name, provider_product_id, monthly_price_cents, yearly_price_cents,
    is_default, free_trial_days, limits, features
"#;

/// `BillingStore` backed by Postgres
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BillingStore for PgStore {
    async fn get_organization(&self, address: &str) -> StoreResult<Option<Organization>> {
        let row: Option<OrganizationRow> = sqlx::query_as(&format!(
            "SELECT {} FROM organizations WHERE address = $1",
            ORGANIZATION_COLUMNS
        ))
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Organization::from))
    }

    async fn set_organization(&self, org: &Organization) -> StoreResult<()> {
        let sub = &org.subscription;
        sqlx::query(
            r#"
            INSERT INTO organizations (
                address, plan_id, provider_subscription_id, billing_period, start_date,
                renewal_date, last_payment_date, subscription_active, billing_email,
                processes, sent_emails, sent_sms, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW(), NOW())
            ON CONFLICT (address) DO UPDATE SET
                plan_id = EXCLUDED.plan_id,
                provider_subscription_id = EXCLUDED.provider_subscription_id,
                billing_period = EXCLUDED.billing_period,
                start_date = EXCLUDED.start_date,
                renewal_date = EXCLUDED.renewal_date,
                last_payment_date = EXCLUDED.last_payment_date,
                subscription_active = EXCLUDED.subscription_active,
                billing_email = EXCLUDED.billing_email,
                processes = EXCLUDED.processes,
                sent_emails = EXCLUDED.sent_emails,
                sent_sms = EXCLUDED.sent_sms,
                updated_at = NOW()
            "#,
        )
        .bind(&org.address)
        .bind(sub.plan_id)
        .bind(&sub.provider_subscription_id)
        .bind(sub.billing_period.as_str())
        .bind(sub.start_date)
        .bind(sub.renewal_date)
        .bind(sub.last_payment_date)
        .bind(sub.active)
        .bind(&sub.email)
        .bind(org.counters.processes)
        .bind(org.counters.sent_emails)
        .bind(org.counters.sent_sms)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_organization_subscription(
        &self,
        address: &str,
        subscription: &OrganizationSubscription,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE organizations SET
                plan_id = $2,
                provider_subscription_id = $3,
                billing_period = $4,
                start_date = $5,
                renewal_date = $6,
                last_payment_date = $7,
                subscription_active = $8,
                billing_email = $9,
                updated_at = NOW()
            WHERE address = $1
            "#,
        )
        .bind(address)
        .bind(subscription.plan_id)
        .bind(&subscription.provider_subscription_id)
        .bind(subscription.billing_period.as_str())
        .bind(subscription.start_date)
        .bind(subscription.renewal_date)
        .bind(subscription.last_payment_date)
        .bind(subscription.active)
        .bind(&subscription.email)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("organization {}", address)));
        }
        Ok(())
    }

    async fn list_organizations(&self) -> StoreResult<Vec<Organization>> {
        let rows: Vec<OrganizationRow> = sqlx::query_as(&format!(
            "SELECT {} FROM organizations ORDER BY address",
            ORGANIZATION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Organization::from).collect())
    }

    async fn get_plan(&self, plan_id: i64) -> StoreResult<Option<Plan>> {
        let row: Option<PlanRow> =
            sqlx::query_as(&format!("SELECT {} FROM plans WHERE id = $1", PLAN_COLUMNS))
                .bind(plan_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(Plan::from))
    }

    async fn get_plan_by_product_id(&self, product_id: &str) -> StoreResult<Option<Plan>> {
        let row: Option<PlanRow> = sqlx::query_as(&format!(
            "SELECT {} FROM plans WHERE provider_product_id = $1",
            PLAN_COLUMNS
        ))
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Plan::from))
    }

    async fn get_default_plan(&self) -> StoreResult<Option<Plan>> {
        let row: Option<PlanRow> = sqlx::query_as(&format!(
            "SELECT {} FROM plans WHERE is_default ORDER BY id LIMIT 1",
            PLAN_COLUMNS
        ))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Plan::from))
    }

    async fn set_plan(&self, plan: &Plan) -> StoreResult<i64> {
        let (id,): (i64,) = if plan.id == 0 {
            sqlx::query_as(
                r#"
                INSERT INTO plans (
                    name, provider_product_id, monthly_price_cents, yearly_price_cents,
                    is_default, free_trial_days, limits, features, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
                RETURNING id
                "#,
            )
            .bind(&plan.name)
            .bind(&plan.provider_product_id)
            .bind(plan.monthly_price_cents)
            .bind(plan.yearly_price_cents)
            .bind(plan.is_default)
            .bind(plan.free_trial_days)
            .bind(Json(plan.limits))
            .bind(Json(plan.features))
            .fetch_one(&self.pool)
            .await?
        } else {
            // Explicit ids bypass the sequence; move it past them so later
            // sequence-assigned inserts cannot collide
            let mut tx = self.pool.begin().await?;
            let row: (i64,) = sqlx::query_as(
                r#"
                INSERT INTO plans (
                    id, name, provider_product_id, monthly_price_cents, yearly_price_cents,
                    is_default, free_trial_days, limits, features, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
                ON CONFLICT (id) DO UPDATE SET
                    name = EXCLUDED.name,
                    provider_product_id = EXCLUDED.provider_product_id,
                    monthly_price_cents = EXCLUDED.monthly_price_cents,
                    yearly_price_cents = EXCLUDED.yearly_price_cents,
                    is_default = EXCLUDED.is_default,
                    free_trial_days = EXCLUDED.free_trial_days,
                    limits = EXCLUDED.limits,
                    features = EXCLUDED.features,
                    updated_at = NOW()
                RETURNING id
                "#,
            )
            .bind(plan.id)
            .bind(&plan.name)
            .bind(&plan.provider_product_id)
            .bind(plan.monthly_price_cents)
            .bind(plan.yearly_price_cents)
            .bind(plan.is_default)
            .bind(plan.free_trial_days)
            .bind(Json(plan.limits))
            .bind(Json(plan.features))
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                SELECT setval(pg_get_serial_sequence('plans', 'id'), (SELECT MAX(id) FROM plans))
                "#,
            )
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            row
        };

        Ok(id)
    }

    async fn list_plans(&self) -> StoreResult<Vec<Plan>> {
        let rows: Vec<PlanRow> =
            sqlx::query_as(&format!("SELECT {} FROM plans ORDER BY id", PLAN_COLUMNS))
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(Plan::from).collect())
    }

    async fn get_usage_snapshot(
        &self,
        address: &str,
        period_start: OffsetDateTime,
    ) -> StoreResult<Option<UsageSnapshot>> {
        let row: Option<SnapshotRow> = sqlx::query_as(
            r#"
            SELECT id, org_address, period_start, period_end, billing_period,
                   baseline_processes, baseline_sent_emails, baseline_sent_sms, created_at
            FROM usage_snapshots
            WHERE org_address = $1 AND period_start = $2
            "#,
        )
        .bind(address)
        .bind(period_start)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(UsageSnapshot::from))
    }

    async fn upsert_usage_snapshot(&self, snapshot: &UsageSnapshot) -> StoreResult<UsageSnapshot> {
        // A concurrent first query may have won the insert; read back whatever is stored
        sqlx::query(
            r#"
            INSERT INTO usage_snapshots (
                id, org_address, period_start, period_end, billing_period,
                baseline_processes, baseline_sent_emails, baseline_sent_sms, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (org_address, period_start) DO NOTHING
            "#,
        )
        .bind(snapshot.id)
        .bind(&snapshot.org_address)
        .bind(snapshot.period_start)
        .bind(snapshot.period_end)
        .bind(snapshot.billing_period.as_str())
        .bind(snapshot.baseline.processes)
        .bind(snapshot.baseline.sent_emails)
        .bind(snapshot.baseline.sent_sms)
        .bind(snapshot.created_at)
        .execute(&self.pool)
        .await?;

        self.get_usage_snapshot(&snapshot.org_address, snapshot.period_start)
            .await?
            .ok_or_else(|| {
                StoreError::NotFound(format!(
                    "usage snapshot {} at {}",
                    snapshot.org_address, snapshot.period_start
                ))
            })
    }

    async fn count_draft_processes(&self, address: &str) -> StoreResult<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM draft_processes WHERE org_address = $1")
                .bind(address)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn count_members(&self, address: &str) -> StoreResult<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM organization_members WHERE org_address = $1")
                .bind(address)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn count_sub_organizations(&self, address: &str) -> StoreResult<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM organizations WHERE parent_address = $1")
                .bind(address)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}
