// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Entitlement Core
//!
//! Cross-component properties that no single module can check on its own:
//! - Webhook replay and duplicate delivery
//! - Quota enforcement under concurrent callers
//! - Tier changes taking effect on the very next usage check
//! - Installment plan completion
//! - Optimistic concurrency on the subscription record

#[cfg(test)]
mod replay_tests {
    use crate::store::EventOutcome;
    use crate::test_support::{self, Harness};
    use crate::verify::sign_payload;
    use crate::webhooks::WebhookOutcome;
    use serde_json::json;
    use time::OffsetDateTime;
    use uuid::Uuid;

    // =========================================================================
    // Same event id delivered twice: same record, same total paid
    // =========================================================================
    #[tokio::test]
    async fn test_duplicate_payment_is_counted_once() {
        let h = Harness::new();
        let user_id = Uuid::new_v4();
        h.subscribe(user_id, "cus_1", "sub_1", test_support::GROWTH_PRICE).await;

        let event = test_support::invoice_event("evt_pay", "invoice.payment_succeeded", "cus_1", "sub_1", 4_900, false);

        assert_eq!(h.billing.webhooks.handle_event(&event).await.unwrap(), WebhookOutcome::Applied);
        let once = h.billing.subscriptions.get(user_id).await.unwrap().unwrap();

        assert_eq!(h.billing.webhooks.handle_event(&event).await.unwrap(), WebhookOutcome::Duplicate);
        let twice = h.billing.subscriptions.get(user_id).await.unwrap().unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.total_paid_cents, 4_900);
    }

    // =========================================================================
    // Signed raw body through verification, then replayed
    // =========================================================================
    #[tokio::test]
    async fn test_signed_delivery_replayed() {
        let h = Harness::new();
        let user_id = Uuid::new_v4();

        let body = json!({
            "id": "evt_checkout",
            "type": "checkout.session.completed",
            "created": 1_717_200_000,
            "data": {
                "object": {
                    "id": "cs_1",
                    "customer": "cus_1",
                    "subscription": null,
                    "client_reference_id": user_id.to_string(),
                    "metadata": {}
                }
            }
        })
        .to_string();
        let header = sign_payload(
            test_support::WEBHOOK_SECRET,
            OffsetDateTime::now_utc().unix_timestamp(),
            &body,
        );

        for expected in [WebhookOutcome::Applied, WebhookOutcome::Duplicate] {
            let event = h.billing.webhooks.verify_event(&body, &header).unwrap();
            assert_eq!(h.billing.webhooks.handle_event(&event).await.unwrap(), expected);
        }

        let record = h.billing.subscriptions.get(user_id).await.unwrap().unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.provider_customer_id.as_deref(), Some("cus_1"));
    }

    // =========================================================================
    // Storage outage: failure is transient and the redelivery applies once
    // =========================================================================
    #[tokio::test]
    async fn test_redelivery_after_outage_applies_once() {
        let h = Harness::new();
        let user_id = Uuid::new_v4();
        h.subscribe(user_id, "cus_1", "sub_1", test_support::GROWTH_PRICE).await;
        let event = test_support::invoice_event("evt_pay", "invoice.payment_succeeded", "cus_1", "sub_1", 1_000, false);

        h.store.set_unavailable(true);
        let err = h.billing.webhooks.handle_event(&event).await.unwrap_err();
        assert!(err.is_transient());
        h.store.set_unavailable(false);

        assert_eq!(h.billing.webhooks.handle_event(&event).await.unwrap(), WebhookOutcome::Applied);
        assert_eq!(h.billing.webhooks.handle_event(&event).await.unwrap(), WebhookOutcome::Duplicate);

        let record = h.billing.subscriptions.get(user_id).await.unwrap().unwrap();
        assert_eq!(record.total_paid_cents, 1_000);
    }

    // =========================================================================
    // A claim left behind by a crashed handler: redelivery is refused while
    // the claim is live and takes the event over once it lapses
    // =========================================================================
    #[tokio::test]
    async fn test_abandoned_claim_is_retried_then_taken_over() {
        let h = Harness::new();
        let user_id = Uuid::new_v4();
        h.subscribe(user_id, "cus_1", "sub_1", test_support::GROWTH_PRICE).await;
        let event = test_support::invoice_event("evt_pay", "invoice.payment_succeeded", "cus_1", "sub_1", 2_500, false);

        h.billing
            .events
            .admit("evt_pay", "invoice.payment_succeeded", OffsetDateTime::now_utc())
            .await
            .unwrap();

        let err = h.billing.webhooks.handle_event(&event).await.unwrap_err();
        assert!(err.is_transient());
        let record = h.billing.subscriptions.get(user_id).await.unwrap().unwrap();
        assert_eq!(record.total_paid_cents, 0);
        let row = h.billing.events.get("evt_pay").await.unwrap().unwrap();
        assert_eq!(row.outcome, EventOutcome::Processing);

        // Same situation, but the claim is older than the lease
        let stale = test_support::invoice_event("evt_old", "invoice.payment_succeeded", "cus_1", "sub_1", 2_500, false);
        h.billing
            .events
            .admit("evt_old", "invoice.payment_succeeded", OffsetDateTime::now_utc() - time::Duration::minutes(5))
            .await
            .unwrap();

        assert_eq!(h.billing.webhooks.handle_event(&stale).await.unwrap(), WebhookOutcome::Applied);
        assert_eq!(h.billing.webhooks.handle_event(&stale).await.unwrap(), WebhookOutcome::Duplicate);

        let record = h.billing.subscriptions.get(user_id).await.unwrap().unwrap();
        assert_eq!(record.total_paid_cents, 2_500);
        let row = h.billing.events.get("evt_old").await.unwrap().unwrap();
        assert_eq!(row.outcome, EventOutcome::Applied);
    }
}

#[cfg(test)]
mod quota_tests {
    use std::sync::Arc;

    use accrue_shared::{ResourceType, SubscriptionTier};
    use time::OffsetDateTime;
    use tokio::sync::Barrier;
    use uuid::Uuid;

    use crate::entitlement::resolve;
    use crate::store::UsageCounter;
    use crate::sync::SubscriptionUpdate;
    use crate::test_support::Harness;
    use crate::usage::PeriodKey;

    fn period() -> PeriodKey {
        "2024-06".parse().unwrap()
    }

    fn seed(h: &Harness, user_id: Uuid, resource: ResourceType, current: i64, limit: i64) {
        h.store
            .put_counter(UsageCounter {
                user_id,
                resource_type: resource,
                period_key: period().as_str().to_string(),
                current,
                limit_value: Some(limit),
                updated_at: OffsetDateTime::now_utc(),
            })
            .unwrap();
    }

    // =========================================================================
    // N concurrent increments at L-1: exactly one accepted
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_increments_never_overrun() {
        let h = Harness::new();
        let user_id = Uuid::new_v4();
        h.billing.subscriptions.get_or_create(user_id).await.unwrap();
        seed(&h, user_id, ResourceType::Transactions, 19, 20);

        let callers = 16;
        let barrier = Arc::new(Barrier::new(callers));
        let mut handles = vec![];

        for _ in 0..callers {
            let ledger = h.billing.usage.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                ledger
                    .check_and_increment(user_id, ResourceType::Transactions, 1, &period())
                    .await
                    .unwrap()
            }));
        }

        let mut accepted = 0;
        for handle in handles {
            let decision = handle.await.unwrap();
            if decision.accepted {
                accepted += 1;
            }
            assert!(decision.current <= 20);
        }

        assert_eq!(accepted, 1, "Exactly one caller should get the last unit");
        let record = h.billing.subscriptions.get(user_id).await.unwrap().unwrap();
        assert_eq!(record.tier, SubscriptionTier::Starter);
        let summary = h
            .billing
            .usage
            .summary(user_id, &resolve(&record), &period())
            .await
            .unwrap();
        let transactions = summary
            .iter()
            .find(|s| s.resource_type == ResourceType::Transactions)
            .unwrap();
        assert_eq!(transactions.current, 20);
    }

    // =========================================================================
    // Downgrade takes effect on the next check; existing usage is kept
    // =========================================================================
    #[tokio::test]
    async fn test_downgrade_rejects_next_increment() {
        let h = Harness::new();
        let user_id = Uuid::new_v4();
        h.billing
            .sync
            .update_user_subscription(
                user_id,
                SubscriptionUpdate {
                    tier: Some(SubscriptionTier::Growth),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        seed(&h, user_id, ResourceType::Reports, 8, 10);

        // Warm the entitlement cache at the old tier
        h.billing.sync.get_entitlement(user_id).await.unwrap();

        h.billing
            .sync
            .update_user_subscription(
                user_id,
                SubscriptionUpdate {
                    tier: Some(SubscriptionTier::Starter),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let decision = h
            .billing
            .usage
            .check_and_increment(user_id, ResourceType::Reports, 1, &period())
            .await
            .unwrap();
        assert!(!decision.accepted);
        assert_eq!(decision.current, 8, "Existing usage must not be reset");
        assert_eq!(decision.remaining, Some(0));
    }

    // =========================================================================
    // Exactly at the limit is accepted, one past is not
    // =========================================================================
    #[tokio::test]
    async fn test_amount_reaching_limit_exactly_is_accepted() {
        let h = Harness::new();
        let user_id = Uuid::new_v4();
        seed(&h, user_id, ResourceType::Transactions, 15, 20);

        let ledger = &h.billing.usage;
        let fits = ledger
            .check_and_increment(user_id, ResourceType::Transactions, 5, &period())
            .await
            .unwrap();
        assert!(fits.accepted);
        assert_eq!(fits.current, 20);

        let over = ledger
            .check_and_increment(user_id, ResourceType::Transactions, 1, &period())
            .await
            .unwrap();
        assert!(!over.accepted);
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use accrue_shared::{ResourceType, SubscriptionTier};
    use serde_json::json;
    use time::OffsetDateTime;
    use uuid::Uuid;

    use crate::store::{SubscriptionStore, UsageCounter};
    use crate::test_support::{self, Harness};
    use crate::tiers::Limit;
    use crate::usage::PeriodKey;
    use crate::webhooks::WebhookOutcome;

    // =========================================================================
    // Starter user upgraded to growth by a subscription.created event
    // =========================================================================
    #[tokio::test]
    async fn test_growth_upgrade_scenario() {
        let h = Harness::new();
        let user_id = Uuid::new_v4();
        let period: PeriodKey = "2024-06".parse().unwrap();

        let before = h.billing.subscriptions.get_or_create(user_id).await.unwrap();
        assert_eq!(before.tier, SubscriptionTier::Starter);
        assert_eq!(before.version, 1);

        h.store
            .put_counter(UsageCounter {
                user_id,
                resource_type: ResourceType::Transactions,
                period_key: period.as_str().to_string(),
                current: 20,
                limit_value: Some(20),
                updated_at: OffsetDateTime::now_utc(),
            })
            .unwrap();

        let event = test_support::event(
            "evt_created",
            "customer.subscription.created",
            json!({
                "id": "sub_1",
                "customer": "cus_1",
                "status": "active",
                "cancel_at_period_end": false,
                "current_period_end": test_support::PERIOD_END,
                "items": { "data": [{ "price": { "id": test_support::GROWTH_PRICE } }] },
                "metadata": { "user_id": user_id.to_string() }
            }),
        );
        assert_eq!(h.billing.webhooks.handle_event(&event).await.unwrap(), WebhookOutcome::Applied);

        let after = h.billing.subscriptions.get(user_id).await.unwrap().unwrap();
        assert_eq!(after.tier, SubscriptionTier::Growth);
        assert_eq!(after.version, 2);

        let view = h.billing.sync.get_entitlement(user_id).await.unwrap();
        assert_eq!(view.entitlement.max_transactions, Limit::Limited(500));

        let decision = h
            .billing
            .usage
            .check_and_increment(user_id, ResourceType::Transactions, 1, &period)
            .await
            .unwrap();
        assert!(decision.accepted);
        assert_eq!(decision.current, 21);
    }

    // =========================================================================
    // 3-payment plan: only the 3rd payment cancels, and only once
    // =========================================================================
    #[tokio::test]
    async fn test_installment_completion_fires_once() {
        let h = Harness::new();
        let user_id = Uuid::new_v4();
        h.subscribe(user_id, "cus_1", "sub_1", test_support::GROWTH_PRICE).await;

        let payment = |n: u32| {
            test_support::invoice_event(
                &format!("evt_pay_{}", n),
                "invoice.payment_succeeded",
                "cus_1",
                "sub_1",
                16_600,
                true,
            )
        };

        for n in 1..=2 {
            h.billing.webhooks.handle_event(&payment(n)).await.unwrap();
            let record = h.billing.subscriptions.get(user_id).await.unwrap().unwrap();
            assert!(!record.cancel_at_period_end, "payment {} must not cancel", n);
        }
        assert!(h.provider.cancel_calls().is_empty());

        assert_eq!(h.billing.webhooks.handle_event(&payment(3)).await.unwrap(), WebhookOutcome::Applied);
        let record = h.billing.subscriptions.get(user_id).await.unwrap().unwrap();
        assert!(record.cancel_at_period_end);
        assert_eq!(record.installment_payments, 3);
        assert_eq!(h.provider.cancel_calls(), vec![("sub_1".to_string(), true)]);

        // Duplicate delivery of the 3rd payment
        assert_eq!(h.billing.webhooks.handle_event(&payment(3)).await.unwrap(), WebhookOutcome::Duplicate);
        assert_eq!(h.provider.cancel_calls().len(), 1);

        // A stray 4th payment does not re-trigger either
        h.billing.webhooks.handle_event(&payment(4)).await.unwrap();
        assert_eq!(h.provider.cancel_calls().len(), 1);
    }

    // =========================================================================
    // Provider cancel fails on the 3rd payment; later syncs keep the plan ended
    // and reconciliation re-sends the cancellation
    // =========================================================================
    #[tokio::test]
    async fn test_failed_installment_cancel_survives_reconcile() {
        let h = Harness::new();
        let user_id = Uuid::new_v4();
        h.subscribe(user_id, "cus_1", "sub_1", test_support::GROWTH_PRICE).await;

        let payment = |n: u32| {
            test_support::invoice_event(
                &format!("evt_pay_{}", n),
                "invoice.payment_succeeded",
                "cus_1",
                "sub_1",
                16_600,
                true,
            )
        };
        for n in 1..=2 {
            h.billing.webhooks.handle_event(&payment(n)).await.unwrap();
        }

        h.provider.fail_next_call();
        assert!(h.billing.webhooks.handle_event(&payment(3)).await.is_err());
        assert!(h.provider.cancel_calls().is_empty());

        let record = h.billing.subscriptions.get(user_id).await.unwrap().unwrap();
        assert!(record.cancel_at_period_end);
        assert_eq!(record.installment_payments, 3);

        // Provider still reports the subscription as renewing
        let updated = test_support::subscription_event(
            "evt_updated",
            "customer.subscription.updated",
            "sub_1",
            "cus_1",
            "active",
            test_support::GROWTH_PRICE,
        );
        h.billing.webhooks.handle_event(&updated).await.unwrap();
        let record = h.billing.subscriptions.get(user_id).await.unwrap().unwrap();
        assert!(record.cancel_at_period_end);

        let summary = h.reconciler().reconcile_all().await.unwrap();
        assert_eq!(summary.provider_repaired, 1);
        assert_eq!(summary.errors, 0);

        let record = h.billing.subscriptions.get(user_id).await.unwrap().unwrap();
        assert!(record.cancel_at_period_end);
        assert_eq!(h.provider.cancel_calls(), vec![("sub_1".to_string(), true)]);

        // Provider now agrees; nothing more to send
        let summary = h.reconciler().reconcile_all().await.unwrap();
        assert_eq!(summary.provider_repaired, 0);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(h.provider.cancel_calls().len(), 1);
    }

    // =========================================================================
    // Zero-amount installment invoices do not advance the plan
    // =========================================================================
    #[tokio::test]
    async fn test_zero_amount_installment_not_counted() {
        let h = Harness::new();
        let user_id = Uuid::new_v4();
        h.subscribe(user_id, "cus_1", "sub_1", test_support::GROWTH_PRICE).await;

        let event = test_support::invoice_event("evt_zero", "invoice.payment_succeeded", "cus_1", "sub_1", 0, true);
        h.billing.webhooks.handle_event(&event).await.unwrap();

        let record = h.billing.subscriptions.get(user_id).await.unwrap().unwrap();
        assert_eq!(record.installment_payments, 0);
    }

    // =========================================================================
    // Deleted subscription drops the tier, keeps the customer link
    // =========================================================================
    #[tokio::test]
    async fn test_deletion_downgrades_and_resubscribe_works() {
        let h = Harness::new();
        let user_id = Uuid::new_v4();
        h.subscribe(user_id, "cus_1", "sub_1", test_support::ACCELERATE_PRICE).await;

        let deleted = test_support::subscription_event(
            "evt_del",
            "customer.subscription.deleted",
            "sub_1",
            "cus_1",
            "canceled",
            test_support::ACCELERATE_PRICE,
        );
        h.billing.webhooks.handle_event(&deleted).await.unwrap();

        let record = h.billing.subscriptions.get(user_id).await.unwrap().unwrap();
        assert_eq!(record.tier, SubscriptionTier::Starter);
        assert_eq!(
            h.billing.subscriptions.store().find_user_by_customer("cus_1").await.unwrap(),
            Some(user_id)
        );

        let resubscribed = test_support::subscription_event(
            "evt_new",
            "customer.subscription.created",
            "sub_2",
            "cus_1",
            "active",
            test_support::GROWTH_PRICE,
        );
        h.billing.webhooks.handle_event(&resubscribed).await.unwrap();
        let record = h.billing.subscriptions.get(user_id).await.unwrap().unwrap();
        assert_eq!(record.tier, SubscriptionTier::Growth);
        assert_eq!(record.provider_subscription_id.as_deref(), Some("sub_2"));
    }
}

#[cfg(test)]
mod concurrency_tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use accrue_shared::SubscriptionTier;
    use async_trait::async_trait;
    use time::OffsetDateTime;
    use tokio::sync::Barrier;
    use uuid::Uuid;

    use crate::cache::EntitlementCache;
    use crate::error::BillingResult;
    use crate::mutations::SubscriptionMutation;
    use crate::store::{InMemoryStore, SubscriptionRecord, SubscriptionStore};
    use crate::subscriptions::SubscriptionService;

    /// Holds the first `gated` reads until that many readers arrive, so
    /// concurrent writers are guaranteed to start from the same version.
    struct GatedReadStore {
        inner: InMemoryStore,
        barrier: Barrier,
        gated: usize,
        reads: AtomicUsize,
    }

    impl GatedReadStore {
        fn new(inner: InMemoryStore, gated: usize) -> Self {
            Self {
                inner,
                barrier: Barrier::new(gated),
                gated,
                reads: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SubscriptionStore for GatedReadStore {
        async fn get_subscription(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
            let record = self.inner.get_subscription(user_id).await?;
            if self.reads.fetch_add(1, Ordering::SeqCst) < self.gated {
                self.barrier.wait().await;
            }
            Ok(record)
        }

        async fn create_subscription_if_absent(&self, record: &SubscriptionRecord) -> BillingResult<SubscriptionRecord> {
            self.inner.create_subscription_if_absent(record).await
        }

        async fn compare_and_swap_subscription(
            &self,
            record: &SubscriptionRecord,
            expected_version: i64,
        ) -> BillingResult<bool> {
            self.inner.compare_and_swap_subscription(record, expected_version).await
        }

        async fn find_user_by_customer(&self, customer_id: &str) -> BillingResult<Option<Uuid>> {
            self.inner.find_user_by_customer(customer_id).await
        }

        async fn list_provider_linked(
            &self,
            after: Option<Uuid>,
            limit: i64,
        ) -> BillingResult<Vec<SubscriptionRecord>> {
            self.inner.list_provider_linked(after, limit).await
        }
    }

    fn racing_service(user_id: Uuid) -> SubscriptionService {
        let inner = InMemoryStore::new();
        inner
            .put_subscription(SubscriptionRecord::new_default(user_id, OffsetDateTime::now_utc()))
            .unwrap();
        SubscriptionService::new(
            Arc::new(GatedReadStore::new(inner, 2)),
            Arc::new(EntitlementCache::default()),
        )
    }

    // =========================================================================
    // Disjoint concurrent mutations both land, one after a retry
    // =========================================================================
    #[tokio::test]
    async fn test_conflicting_writers_converge() {
        let user_id = Uuid::new_v4();
        let service = racing_service(user_id);

        let upgrade = SubscriptionMutation::AdminOverride {
            tier: Some(SubscriptionTier::Growth),
            accelerator_access: None,
        };
        let failed = SubscriptionMutation::PaymentFailed {
            failed_at: OffsetDateTime::now_utc(),
        };

        let (a, b) = tokio::join!(
            service.apply_event(user_id, &upgrade, None),
            service.apply_event(user_id, &failed, None),
        );
        a.unwrap();
        b.unwrap();

        let record = service.get(user_id).await.unwrap().unwrap();
        assert_eq!(record.version, 3, "Both writes commit, one after a retry");
        assert_eq!(record.tier, SubscriptionTier::Growth);
        assert!(record.payment_failed_at.is_some());
    }

    // =========================================================================
    // Same-field conflict: last committer wins, nothing is lost silently
    // =========================================================================
    #[tokio::test]
    async fn test_same_field_conflict_is_last_writer_wins() {
        let user_id = Uuid::new_v4();
        let service = racing_service(user_id);

        let growth = SubscriptionMutation::AdminOverride {
            tier: Some(SubscriptionTier::Growth),
            accelerator_access: None,
        };
        let accelerate = SubscriptionMutation::AdminOverride {
            tier: Some(SubscriptionTier::Accelerate),
            accelerator_access: None,
        };

        let (a, b) = tokio::join!(
            service.apply_event(user_id, &growth, None),
            service.apply_event(user_id, &accelerate, None),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        let record = service.get(user_id).await.unwrap().unwrap();
        assert_eq!(record.version, 3);
        let last = if a.record.version > b.record.version { a } else { b };
        assert_eq!(record.tier, last.record.tier);
    }

    // =========================================================================
    // Pinned version: the loser is told, not retried
    // =========================================================================
    #[tokio::test]
    async fn test_pinned_writer_loses_without_retry() {
        let user_id = Uuid::new_v4();
        let service = racing_service(user_id);

        let pinned = SubscriptionMutation::AdminOverride {
            tier: Some(SubscriptionTier::Growth),
            accelerator_access: None,
        };
        let other = SubscriptionMutation::PaymentFailed {
            failed_at: OffsetDateTime::now_utc(),
        };

        let (a, b) = tokio::join!(
            service.apply_event(user_id, &pinned, Some(1)),
            service.apply_event(user_id, &other, Some(1)),
        );

        let committed = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(committed, 1);
        assert_eq!(service.get(user_id).await.unwrap().unwrap().version, 2);
    }
}
