//! Usage accounting over annual billing periods
//!
//! Lifetime counters only grow. Period usage is `lifetime - baseline`, where
//! the baseline is a snapshot of the lifetime counters taken the first time a
//! period is observed. Monthly subscriptions have no period notion distinct
//! from lifetime counters.

use std::sync::Arc;

use tally_shared::{
    BillingPeriod, BillingStore, Organization, OrganizationSubscription, UsageCounters,
    UsageSnapshot,
};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};

/// Half-open `[start, end)` billing period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodWindow {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

impl PeriodWindow {
    pub fn contains(&self, at: OffsetDateTime) -> bool {
        self.start <= at && at < self.end
    }
}

/// Usage attributed to the current period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodUsage {
    pub counters: UsageCounters,
    /// `false` when no annual period applies and `counters` are lifetime values
    pub period_active: bool,
    pub period: Option<PeriodWindow>,
}

/// Shift `at` by whole years, clamping Feb 29 to Feb 28 in non-leap years
pub fn add_years(at: OffsetDateTime, years: i32) -> Option<OffsetDateTime> {
    let year = at.year().checked_add(years)?;
    let date = Date::from_calendar_date(year, at.month(), at.day())
        .or_else(|_| Date::from_calendar_date(year, at.month(), 28))
        .ok()?;
    Some(at.replace_date(date))
}

/// Annual period containing `now`, rolled forward from the subscription start.
///
/// `None` for monthly subscriptions and for annual ones without a start date.
pub fn current_period(
    subscription: &OrganizationSubscription,
    now: OffsetDateTime,
) -> Option<PeriodWindow> {
    if subscription.billing_period != BillingPeriod::Annual {
        return None;
    }
    let anchor = subscription.start_date?;

    // Always offset from the anchor so a Feb 29 start comes back in leap years
    let mut elapsed = (now.year() - anchor.year()).max(0);
    let mut start = add_years(anchor, elapsed)?;
    if start > now && elapsed > 0 {
        elapsed -= 1;
        start = add_years(anchor, elapsed)?;
    }
    let end = add_years(anchor, elapsed + 1)?;

    Some(PeriodWindow { start, end })
}

pub struct UsageMeter {
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
}

impl UsageMeter {
    pub fn new(store: Arc<dyn BillingStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Period usage for an organization, creating the period baseline on first query
    pub async fn period_usage(&self, org_address: &str) -> BillingResult<PeriodUsage> {
        let org = self
            .store
            .get_organization(org_address)
            .await?
            .ok_or_else(|| BillingError::OrganizationNotFound(org_address.to_string()))?;
        self.period_usage_for(&org).await
    }

    /// Same as [`period_usage`](Self::period_usage) for an already loaded organization
    pub async fn period_usage_for(&self, org: &Organization) -> BillingResult<PeriodUsage> {
        let Some(window) = current_period(&org.subscription, self.clock.now()) else {
            return Ok(PeriodUsage {
                counters: org.counters,
                period_active: false,
                period: None,
            });
        };

        let baseline = match self
            .store
            .get_usage_snapshot(&org.address, window.start)
            .await?
        {
            Some(snapshot) => snapshot.baseline,
            None => self.open_period(org, window).await?.baseline,
        };

        Ok(PeriodUsage {
            counters: org.counters.since(&baseline),
            period_active: true,
            period: Some(window),
        })
    }

    /// Make sure the current annual period has a baseline.
    ///
    /// Returns the stored snapshot, or `None` when the organization is not on
    /// an annual period.
    pub async fn ensure_snapshot(
        &self,
        org: &Organization,
    ) -> BillingResult<Option<UsageSnapshot>> {
        let Some(window) = current_period(&org.subscription, self.clock.now()) else {
            return Ok(None);
        };
        if let Some(existing) = self
            .store
            .get_usage_snapshot(&org.address, window.start)
            .await?
        {
            return Ok(Some(existing));
        }
        self.open_period(org, window).await.map(Some)
    }

    async fn open_period(
        &self,
        org: &Organization,
        window: PeriodWindow,
    ) -> BillingResult<UsageSnapshot> {
        let candidate = UsageSnapshot {
            id: Uuid::new_v4(),
            org_address: org.address.clone(),
            period_start: window.start,
            period_end: window.end,
            billing_period: org.subscription.billing_period,
            baseline: org.counters,
            created_at: self.clock.now(),
        };

        // A concurrent first query may have won; the stored row is authoritative
        let stored = self.store.upsert_usage_snapshot(&candidate).await?;
        if stored.id == candidate.id {
            tracing::info!(
                org_address = %org.address,
                period_start = %window.start,
                period_end = %window.end,
                processes = stored.baseline.processes,
                sent_emails = stored.baseline.sent_emails,
                sent_sms = stored.baseline.sent_sms,
                "Opened usage period with baseline snapshot"
            );
        }
        Ok(stored)
    }
}
