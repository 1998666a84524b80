//! Stripe webhook dispatch
//!
//! Per event: verify signature, skip duplicates, take the tenant lock,
//! reconcile, release, then mark the event processed. The mark only happens
//! after the handler succeeded; a failed handler surfaces its error so the
//! provider redelivers.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;

use crate::client::PaymentProvider;
use crate::error::{BillingError, BillingResult};
use crate::events::{EventKind, WebhookEvent};
use crate::idempotency::IdempotencyLedger;
use crate::locks::EntityLockManager;
use crate::subscriptions::{FollowUp, ReconcileOutcome, SubscriptionService};

/// Attempts after the first failed idempotency mark
const MARK_RETRIES: usize = 2;

/// What happened to a delivered event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Handler ran and the event is now recorded
    Processed,
    /// Event id was already in the ledger; nothing ran
    AlreadyProcessed,
    /// Event type is not handled; recorded so it is not redelivered
    Ignored,
}

enum Dispatch {
    Done(ReconcileOutcome, FollowUp),
    Duplicate,
}

pub struct WebhookHandler {
    provider: Arc<dyn PaymentProvider>,
    ledger: Arc<dyn IdempotencyLedger>,
    locks: Arc<EntityLockManager>,
    subscriptions: Arc<SubscriptionService>,
    /// Serializes plan catalog updates, which are not tenant scoped
    catalog_lock: Mutex<()>,
}

impl WebhookHandler {
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        ledger: Arc<dyn IdempotencyLedger>,
        locks: Arc<EntityLockManager>,
        subscriptions: Arc<SubscriptionService>,
    ) -> Self {
        Self {
            provider,
            ledger,
            locks,
            subscriptions,
            catalog_lock: Mutex::new(()),
        }
    }

    /// Entry point for the HTTP layer. Safe to call repeatedly with the same payload.
    pub async fn process_webhook_event(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> BillingResult<WebhookOutcome> {
        let event = self.provider.verify_and_parse_event(payload, signature).map_err(|e| {
            tracing::warn!(
                error = %e,
                payload_len = payload.len(),
                "Rejected webhook delivery"
            );
            e
        })?;
        self.handle_event(event).await
    }

    /// Dispatch an already verified event
    pub async fn handle_event(&self, event: WebhookEvent) -> BillingResult<WebhookOutcome> {
        if self.ledger.exists(&event.id).await? {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Webhook event already processed, skipping"
            );
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        if matches!(event.kind, EventKind::Unhandled) {
            tracing::info!(
                event_type = %event.event_type,
                event_id = %event.id,
                "Received unhandled Stripe event type - no handler configured"
            );
            self.mark_processed(&event.id).await;
            return Ok(WebhookOutcome::Ignored);
        }

        let dispatched = self.dispatch(&event).await.map_err(|e| {
            if e.is_retryable() {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    event_created = event.created,
                    org_address = ?event.kind.org_address(),
                    error = %e,
                    "Webhook handler failed, leaving event for redelivery"
                );
            } else {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    org_address = ?event.kind.org_address(),
                    error = %e,
                    "Webhook event rejected"
                );
            }
            e
        })?;

        match dispatched {
            Dispatch::Duplicate => Ok(WebhookOutcome::AlreadyProcessed),
            Dispatch::Done(outcome, follow_up) => {
                self.subscriptions.run_follow_up(follow_up).await;
                self.mark_processed(&event.id).await;

                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    event_created = event.created,
                    org_address = ?event.kind.org_address(),
                    outcome = ?outcome,
                    "Webhook event processed"
                );
                Ok(WebhookOutcome::Processed)
            }
        }
    }

    /// Run the handler under the lock that scopes the event
    async fn dispatch(&self, event: &WebhookEvent) -> BillingResult<Dispatch> {
        match &event.kind {
            EventKind::Subscription(sub) => {
                let _guard = self.locks.lock(&sub.org_address).await;
                if self.ledger.exists(&event.id).await? {
                    return Ok(Dispatch::Duplicate);
                }
                let reconciled = self.subscriptions.apply_subscription_event(sub).await?;
                Ok(Dispatch::Done(reconciled.outcome, reconciled.follow_up))
            }
            EventKind::InvoicePaid(invoice) => {
                let _guard = self.locks.lock(&invoice.org_address).await;
                if self.ledger.exists(&event.id).await? {
                    return Ok(Dispatch::Duplicate);
                }
                let outcome = self.subscriptions.apply_invoice_paid(invoice).await?;
                Ok(Dispatch::Done(outcome, FollowUp::default()))
            }
            EventKind::ProductUpdated(product) => {
                let _guard = self.catalog_lock.lock().await;
                if self.ledger.exists(&event.id).await? {
                    return Ok(Dispatch::Duplicate);
                }
                let outcome = self.subscriptions.apply_product_updated(product).await?;
                Ok(Dispatch::Done(outcome, FollowUp::default()))
            }
            EventKind::Unhandled => Err(BillingError::InvalidEvent(format!(
                "no handler for {}",
                event.event_type
            ))),
        }
    }

    /// Record the event, retrying briefly. A lost mark only costs a redundant
    /// replay, so failure is logged and not returned.
    async fn mark_processed(&self, event_id: &str) {
        let strategy = ExponentialBackoff::from_millis(10).take(MARK_RETRIES);
        let ledger = &self.ledger;

        if let Err(e) = Retry::spawn(strategy, || ledger.mark_processed(event_id)).await {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to mark webhook event processed; a redelivery will be reapplied"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ProviderPrice, ProviderProduct};
    use crate::clock::FixedClock;
    use crate::idempotency::InMemoryLedger;
    use crate::test_support::{
        invoice_payload, product_payload, seed_catalog, subscription_payload, unhandled_payload,
        FakeProvider, PERIOD_START, PRO_PLAN_ID,
    };
    use crate::usage::UsageMeter;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tally_shared::{BillingPeriod, BillingStore, MemoryStore, Organization};
    use tokio::sync::Barrier;
    use time::macros::datetime;

    struct Harness {
        store: Arc<MemoryStore>,
        provider: Arc<FakeProvider>,
        ledger: Arc<InMemoryLedger>,
        handler: WebhookHandler,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        seed_catalog(&store).await;
        store.set_organization(&Organization::new("0xorg")).await.unwrap();

        let clock = Arc::new(FixedClock::new(datetime!(2026-01-15 12:00 UTC)));
        let provider = Arc::new(FakeProvider::new(clock.clone()));
        provider.add_customer("cus_0xorg", Some("billing@0xorg.test"));
        let ledger = Arc::new(InMemoryLedger::new(Duration::from_secs(86_400), clock.clone()));
        let usage = Arc::new(UsageMeter::new(store.clone(), clock.clone()));
        let subscriptions = Arc::new(SubscriptionService::new(
            store.clone(),
            provider.clone(),
            usage,
            clock,
        ));
        let handler = WebhookHandler::new(
            provider.clone(),
            ledger.clone(),
            Arc::new(EntityLockManager::new()),
            subscriptions,
        );

        Harness {
            store,
            provider,
            ledger,
            handler,
        }
    }

    fn active_payload(event_id: &str) -> Vec<u8> {
        subscription_payload(
            event_id,
            "0xorg",
            "sub_1",
            "active",
            "month",
            PERIOD_START,
            datetime!(2026-02-15 00:00 UTC),
        )
    }

    #[tokio::test]
    async fn test_signed_event_is_processed_and_recorded() {
        let h = harness().await;
        let payload = active_payload("evt_1");
        let signature = h.provider.sign(&payload);

        let outcome = h.handler.process_webhook_event(&payload, &signature).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);
        assert!(h.ledger.exists("evt_1").await.unwrap());

        let org = h.store.get_organization("0xorg").await.unwrap().unwrap();
        assert_eq!(org.subscription.plan_id, PRO_PLAN_ID);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_skipped() {
        let h = harness().await;
        let payload = active_payload("evt_1");
        let signature = h.provider.sign(&payload);

        h.handler.process_webhook_event(&payload, &signature).await.unwrap();
        let second = h.handler.process_webhook_event(&payload, &signature).await.unwrap();

        assert_eq!(second, WebhookOutcome::AlreadyProcessed);
        assert_eq!(h.store.subscription_write_count(), 1);
    }

    #[tokio::test]
    async fn test_bad_signature_has_no_side_effects() {
        let h = harness().await;
        let payload = active_payload("evt_1");

        let err = h
            .handler
            .process_webhook_event(&payload, "t=1,v1=00")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
        assert!(!h.ledger.exists("evt_1").await.unwrap());
        assert_eq!(h.store.subscription_write_count(), 0);
    }

    #[tokio::test]
    async fn test_unhandled_type_is_marked_processed() {
        let h = harness().await;
        let payload = unhandled_payload("evt_x");
        let signature = h.provider.sign(&payload);

        let outcome = h.handler.process_webhook_event(&payload, &signature).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);
        assert!(h.ledger.exists("evt_x").await.unwrap());
    }

    #[tokio::test]
    async fn test_handler_failure_is_not_marked() {
        let h = harness().await;
        let payload = subscription_payload(
            "evt_missing_org",
            "0xnobody",
            "sub_9",
            "active",
            "month",
            PERIOD_START,
            datetime!(2026-02-15 00:00 UTC),
        );
        let signature = h.provider.sign(&payload);

        let err = h.handler.process_webhook_event(&payload, &signature).await.unwrap_err();
        assert!(matches!(err, BillingError::OrganizationNotFound(_)));
        assert!(!h.ledger.exists("evt_missing_org").await.unwrap());
    }

    #[tokio::test]
    async fn test_invoice_event_records_payment() {
        let h = harness().await;
        let paid_at = datetime!(2026-01-15 12:01 UTC);
        let payload = invoice_payload("evt_inv", "0xorg", paid_at);
        let signature = h.provider.sign(&payload);

        h.handler.process_webhook_event(&payload, &signature).await.unwrap();
        let org = h.store.get_organization("0xorg").await.unwrap().unwrap();
        assert_eq!(org.subscription.last_payment_date, Some(paid_at));
    }

    #[tokio::test]
    async fn test_product_event_for_unknown_product_is_processed() {
        let h = harness().await;
        let payload = product_payload("evt_prod", "prod_merch");
        let signature = h.provider.sign(&payload);

        let outcome = h.handler.process_webhook_event(&payload, &signature).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);
        assert!(h.ledger.exists("evt_prod").await.unwrap());
    }

    // ========================================================================
    // Catalog events
    // ========================================================================

    fn pro_product(name: &str) -> ProviderProduct {
        ProviderProduct {
            id: "prod_pro".into(),
            name: name.into(),
            active: true,
            metadata: Default::default(),
        }
    }

    fn monthly_price(amount: i64) -> ProviderPrice {
        ProviderPrice {
            id: format!("price_month_{}", amount),
            active: true,
            interval: Some(BillingPeriod::Monthly),
            unit_amount: Some(amount),
        }
    }

    #[tokio::test]
    async fn test_product_fetch_failure_is_retryable_and_unmarked() {
        let h = harness().await;
        h.provider.fail_product_fetches(true);
        let payload = product_payload("evt_prod_down", "prod_pro");
        let signature = h.provider.sign(&payload);

        let err = h
            .handler
            .process_webhook_event(&payload, &signature)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::ProviderTimeout(_)));
        assert!(err.is_retryable());
        assert!(!h.ledger.exists("evt_prod_down").await.unwrap());

        // Redelivery after the provider recovers applies the update
        h.provider.fail_product_fetches(false);
        h.provider.set_product(pro_product("Pro"), vec![monthly_price(1900)]);
        let outcome = h.handler.process_webhook_event(&payload, &signature).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);
        let plan = h.store.get_plan(PRO_PLAN_ID).await.unwrap().unwrap();
        assert_eq!(plan.monthly_price_cents, Some(1900));
    }

    #[tokio::test]
    async fn test_concurrent_product_events_are_serialized() {
        let h = Arc::new(harness().await);
        h.provider.set_product(pro_product("Pro"), vec![monthly_price(2500)]);
        let barrier = Arc::new(Barrier::new(6));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let h = h.clone();
                let barrier = barrier.clone();
                let payload = product_payload(&format!("evt_prod_{}", i), "prod_pro");
                tokio::spawn(async move {
                    let signature = h.provider.sign(&payload);
                    barrier.wait().await;
                    h.handler.process_webhook_event(&payload, &signature).await
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), WebhookOutcome::Processed);
        }

        assert_eq!(h.provider.max_concurrent_product_fetches(), 1);
        for i in 0..6 {
            assert!(h.ledger.exists(&format!("evt_prod_{}", i)).await.unwrap());
        }
        let plan = h.store.get_plan(PRO_PLAN_ID).await.unwrap().unwrap();
        assert_eq!(plan.monthly_price_cents, Some(2500));
    }

    // ========================================================================
    // Ledger failures
    // ========================================================================

    /// Ledger whose marks fail a fixed number of times
    struct FlakyLedger {
        inner: InMemoryLedger,
        failures_left: AtomicUsize,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl IdempotencyLedger for FlakyLedger {
        async fn exists(&self, event_id: &str) -> BillingResult<bool> {
            self.inner.exists(event_id).await
        }

        async fn mark_processed(&self, event_id: &str) -> BillingResult<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(BillingError::Database("ledger unavailable".into()));
            }
            self.inner.mark_processed(event_id).await
        }

        async fn purge_expired(&self) -> BillingResult<u64> {
            self.inner.purge_expired().await
        }
    }

    async fn flaky_handler(
        failures: usize,
    ) -> (Arc<FlakyLedger>, Arc<FakeProvider>, WebhookHandler) {
        let store = Arc::new(MemoryStore::new());
        seed_catalog(&store).await;
        store.set_organization(&Organization::new("0xorg")).await.unwrap();
        let clock = Arc::new(FixedClock::new(datetime!(2026-01-15 12:00 UTC)));
        let provider = Arc::new(FakeProvider::new(clock.clone()));
        let ledger = Arc::new(FlakyLedger {
            inner: InMemoryLedger::new(Duration::from_secs(86_400), clock.clone()),
            failures_left: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        });
        let usage = Arc::new(UsageMeter::new(store.clone(), clock.clone()));
        let subscriptions = Arc::new(SubscriptionService::new(
            store,
            provider.clone(),
            usage,
            clock,
        ));
        let handler = WebhookHandler::new(
            provider.clone(),
            ledger.clone(),
            Arc::new(EntityLockManager::new()),
            subscriptions,
        );
        (ledger, provider, handler)
    }

    #[tokio::test]
    async fn test_mark_is_retried() {
        let (ledger, provider, handler) = flaky_handler(1).await;
        let payload = unhandled_payload("evt_retry");
        let signature = provider.sign(&payload);

        handler.process_webhook_event(&payload, &signature).await.unwrap();
        assert_eq!(ledger.attempts.load(Ordering::SeqCst), 2);
        assert!(ledger.exists("evt_retry").await.unwrap());
    }

    #[tokio::test]
    async fn test_lost_mark_does_not_fail_delivery() {
        let (ledger, provider, handler) = flaky_handler(10).await;
        let payload = invoice_payload("evt_lost", "0xorg", datetime!(2026-01-15 12:01 UTC));
        let signature = provider.sign(&payload);

        let outcome = handler.process_webhook_event(&payload, &signature).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);
        assert_eq!(ledger.attempts.load(Ordering::SeqCst), 1 + MARK_RETRIES);
        assert!(!ledger.exists("evt_lost").await.unwrap());
    }
}
