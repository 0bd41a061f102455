// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge case tests for the reconciliation pipeline.
//!
//! Scenario tests driving the full engine over the in-memory stores:
//! - Idempotent and concurrent duplicate delivery
//! - Out-of-order delivery
//! - Cancellation and payment-failure grace windows
//! - Operator retry and recovery
//! - History fold reconstruction

mod support {
    use std::sync::Arc;

    use crate::engine::ReconciliationEngine;
    use crate::events::InboundEvent;
    use crate::plans::PlanCatalog;
    use crate::testing::{
        InMemoryAccountStore, InMemoryEventStore, InMemoryHistoryStore, RecordingSink,
    };

    pub struct Harness {
        pub engine: ReconciliationEngine,
        pub events: Arc<InMemoryEventStore>,
        pub accounts: Arc<InMemoryAccountStore>,
        pub history: Arc<InMemoryHistoryStore>,
        pub sink: Arc<RecordingSink>,
    }

    impl Harness {
        pub fn new() -> Self {
            Self::with_catalog(PlanCatalog::builtin())
        }

        pub fn with_catalog(catalog: PlanCatalog) -> Self {
            let events = Arc::new(InMemoryEventStore::new());
            let accounts = Arc::new(InMemoryAccountStore::new());
            let history = Arc::new(InMemoryHistoryStore::new());
            let sink = Arc::new(RecordingSink::new());

            let engine = ReconciliationEngine::new(
                events.clone(),
                accounts.clone(),
                history.clone(),
                Arc::new(catalog),
                sink.clone(),
            );

            Harness {
                engine,
                events,
                accounts,
                history,
                sink,
            }
        }

        /// A second engine over the same stores with a different catalog,
        /// as after an operator config fix and redeploy.
        pub fn engine_with_catalog(&self, catalog: PlanCatalog) -> ReconciliationEngine {
            ReconciliationEngine::new(
                self.events.clone(),
                self.accounts.clone(),
                self.history.clone(),
                Arc::new(catalog),
                self.sink.clone(),
            )
        }
    }

    /// Let spawned notification tasks run to completion.
    pub async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    pub fn month_from_now() -> i64 {
        time::OffsetDateTime::now_utc().unix_timestamp() + 30 * 86_400
    }

    pub fn customer_created(event_id: &str, customer_id: &str, email: &str) -> InboundEvent {
        InboundEvent {
            id: event_id.to_string(),
            event_type: "customer.created".to_string(),
            data: serde_json::json!({
                "object": { "id": customer_id, "email": email }
            }),
        }
    }

    pub fn subscription_event(
        event_id: &str,
        event_type: &str,
        subscription_id: &str,
        customer_id: &str,
        price_id: &str,
        status: &str,
        period_end: i64,
    ) -> InboundEvent {
        InboundEvent {
            id: event_id.to_string(),
            event_type: event_type.to_string(),
            data: serde_json::json!({
                "object": {
                    "id": subscription_id,
                    "customer": customer_id,
                    "status": status,
                    "items": { "data": [ { "price": { "id": price_id } } ] },
                    "current_period_start": period_end - 30 * 86_400,
                    "current_period_end": period_end,
                }
            }),
        }
    }

    pub fn invoice_event(
        event_id: &str,
        event_type: &str,
        customer_id: &str,
        subscription_id: &str,
        amount_cents: i64,
    ) -> InboundEvent {
        let amount_field = if event_type == "invoice.paid" {
            "amount_paid"
        } else {
            "amount_due"
        };
        let mut object = serde_json::json!({
            "id": format!("in_{event_id}"),
            "customer": customer_id,
            "subscription": subscription_id,
            "currency": "usd",
        });
        object[amount_field] = serde_json::json!(amount_cents);

        InboundEvent {
            id: event_id.to_string(),
            event_type: event_type.to_string(),
            data: serde_json::json!({ "object": object }),
        }
    }
}

mod idempotency_tests {
    use super::support::*;
    use crate::store::EventStore;
    use draftly_shared::SubscriptionTier;

    // =========================================================================
    // Submitting subscription.created for price_starter on a fresh account:
    // tier=starter, access granted, one history entry, one welcome.
    // The identical delivery again: success, nothing else changes.
    // =========================================================================
    #[tokio::test]
    async fn duplicate_delivery_applies_exactly_once() {
        let h = Harness::new();
        let account_id = h.accounts.seed_account("writer@example.com");
        h.engine
            .ingest(customer_created("evt_cus", "cus_1", "writer@example.com"))
            .await;

        let event = subscription_event(
            "evt_sub_created",
            "customer.subscription.created",
            "sub_1",
            "cus_1",
            "price_starter",
            "active",
            month_from_now(),
        );

        let first = h.engine.ingest(event.clone()).await;
        settle().await;
        assert!(first.success);
        assert!(!first.duplicate);

        let account = h.accounts.get(account_id).unwrap();
        assert_eq!(account.tier, SubscriptionTier::Starter);
        assert!(account.access_granted);

        let history = h.history.all();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].plan_name, "starter");
        assert_eq!(history[0].amount_cents, 4700);
        assert_eq!(h.sink.count_of("welcome"), 1);

        // Second identical delivery short-circuits before any handler.
        let second = h.engine.ingest(event).await;
        settle().await;
        assert!(second.success);
        assert!(second.duplicate);
        assert_eq!(h.history.all().len(), 1, "no second history entry");
        assert_eq!(h.sink.count_of("welcome"), 1, "no second welcome");
    }

    // =========================================================================
    // Two deliveries of the same event racing: only one runs the handler.
    // =========================================================================
    #[tokio::test]
    async fn concurrent_duplicate_deliveries_commit_once() {
        use std::sync::Arc;
        use tokio::sync::Barrier;

        let h = Harness::new();
        h.accounts.seed_account("writer@example.com");
        h.engine
            .ingest(customer_created("evt_cus", "cus_1", "writer@example.com"))
            .await;

        let event = subscription_event(
            "evt_race",
            "customer.subscription.created",
            "sub_1",
            "cus_1",
            "price_starter",
            "active",
            month_from_now(),
        );

        let engine = Arc::new(h.engine.clone());
        let barrier = Arc::new(Barrier::new(2));
        let mut handles = vec![];
        for _ in 0..2 {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            let event = event.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                engine.ingest(event).await
            }));
        }

        let mut results = vec![];
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        settle().await;

        assert!(results.iter().all(|r| r.success));
        assert_eq!(h.history.all().len(), 1, "handler must commit exactly once");
        assert!(h.sink.count_of("welcome") <= 1);
    }

    // =========================================================================
    // Redelivery of a failed event does not re-run the handler.
    // =========================================================================
    #[tokio::test]
    async fn redelivery_of_failed_event_reports_prior_error() {
        let h = Harness::new();
        // No account seeded: subscription event will fail with missing_account.
        let event = subscription_event(
            "evt_orphan",
            "customer.subscription.created",
            "sub_9",
            "cus_9",
            "price_starter",
            "active",
            month_from_now(),
        );

        let first = h.engine.ingest(event.clone()).await;
        assert!(!first.success);

        let second = h.engine.ingest(event).await;
        assert!(!second.success);
        assert!(second.duplicate);
        assert!(second.error.unwrap().contains("missing_account"));

        let record = h.events.get("evt_orphan").await.unwrap().unwrap();
        assert_eq!(record.attempts, 1, "redelivery must not burn an attempt");
    }
}

mod order_tests {
    use super::support::*;
    use draftly_shared::{SubscriptionStatus, SubscriptionTier};

    // =========================================================================
    // subscription.updated before subscription.created, no linkage yet:
    // fails safely, then succeeds on retry after the linkage event lands.
    // =========================================================================
    #[tokio::test]
    async fn update_before_linkage_fails_then_recovers_on_retry() {
        let h = Harness::new();
        let account_id = h.accounts.seed_account("writer@example.com");

        let updated = subscription_event(
            "evt_updated",
            "customer.subscription.updated",
            "sub_1",
            "cus_1",
            "price_pro",
            "active",
            month_from_now(),
        );

        let result = h.engine.ingest(updated).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("no account matched"));

        // Account state untouched by the failure.
        let account = h.accounts.get(account_id).unwrap();
        assert_eq!(account.tier, SubscriptionTier::Free);

        // The linkage arrives via customer.created, then the operator
        // retries the stranded event.
        h.engine
            .ingest(customer_created("evt_cus", "cus_1", "writer@example.com"))
            .await;
        let retried = h.engine.retry("evt_updated").await;
        settle().await;
        assert!(retried.success);

        let account = h.accounts.get(account_id).unwrap();
        assert_eq!(account.tier, SubscriptionTier::Pro);
        assert_eq!(account.status, SubscriptionStatus::Active);
        assert_eq!(h.history.all().len(), 1);
    }

    // =========================================================================
    // With linkage in place, created-then-updated and updated-then-created
    // converge to the same final state.
    // =========================================================================
    #[tokio::test]
    async fn delivery_order_does_not_change_final_state() {
        let period_end = month_from_now();

        let run = |reverse: bool| async move {
            let h = Harness::new();
            let account_id = h.accounts.seed_account("writer@example.com");
            h.engine
                .ingest(customer_created("evt_cus", "cus_1", "writer@example.com"))
                .await;

            let created = subscription_event(
                "evt_created",
                "customer.subscription.created",
                "sub_1",
                "cus_1",
                "price_pro",
                "active",
                period_end,
            );
            let updated = subscription_event(
                "evt_updated",
                "customer.subscription.updated",
                "sub_1",
                "cus_1",
                "price_pro",
                "active",
                period_end,
            );

            if reverse {
                assert!(h.engine.ingest(updated).await.success);
                assert!(h.engine.ingest(created).await.success);
            } else {
                assert!(h.engine.ingest(created).await.success);
                assert!(h.engine.ingest(updated).await.success);
            }
            settle().await;
            h.accounts.get(account_id).unwrap()
        };

        let forward = run(false).await;
        let reversed = run(true).await;

        // Handlers compute absolute state from the payload, so both orders
        // converge on the same entitlements.
        assert_eq!(forward.tier, reversed.tier);
        assert_eq!(forward.status, reversed.status);
        assert_eq!(forward.access_granted, reversed.access_granted);
        assert_eq!(forward.current_period_end, reversed.current_period_end);
        assert_eq!(
            forward.stripe_subscription_id,
            reversed.stripe_subscription_id
        );
        assert_eq!(forward.tier, SubscriptionTier::Pro);
    }
}

mod grace_tests {
    use super::support::*;
    use draftly_shared::{SubscriptionStatus, SubscriptionTier};

    async fn starter_harness() -> (Harness, uuid::Uuid) {
        let h = Harness::new();
        let account_id = h.accounts.seed_account("writer@example.com");
        h.engine
            .ingest(customer_created("evt_cus", "cus_1", "writer@example.com"))
            .await;
        let created = subscription_event(
            "evt_created",
            "customer.subscription.created",
            "sub_1",
            "cus_1",
            "price_starter",
            "active",
            month_from_now(),
        );
        assert!(h.engine.ingest(created).await.success);
        (h, account_id)
    }

    // =========================================================================
    // Cancellation before period end keeps tier and access (the sweep
    // revokes later, not this event).
    // =========================================================================
    #[tokio::test]
    async fn cancellation_mid_period_retains_access() {
        let (h, account_id) = starter_harness().await;

        let deleted = subscription_event(
            "evt_deleted",
            "customer.subscription.deleted",
            "sub_1",
            "cus_1",
            "price_starter",
            "canceled",
            month_from_now(),
        );
        assert!(h.engine.ingest(deleted).await.success);
        settle().await;

        let account = h.accounts.get(account_id).unwrap();
        assert_eq!(account.status, SubscriptionStatus::Canceled);
        assert_eq!(account.tier, SubscriptionTier::Starter, "tier retained");
        assert!(account.access_granted, "access persists until period end");
    }

    // =========================================================================
    // Cancellation after the period already elapsed downgrades immediately.
    // =========================================================================
    #[tokio::test]
    async fn cancellation_after_period_end_downgrades() {
        let (h, account_id) = starter_harness().await;

        let past = time::OffsetDateTime::now_utc().unix_timestamp() - 86_400;
        let deleted = subscription_event(
            "evt_deleted",
            "customer.subscription.deleted",
            "sub_1",
            "cus_1",
            "price_starter",
            "canceled",
            past,
        );
        assert!(h.engine.ingest(deleted).await.success);

        let account = h.accounts.get(account_id).unwrap();
        assert_eq!(account.tier, SubscriptionTier::Free);
        assert!(!account.access_granted);
        assert_eq!(account.status, SubscriptionStatus::Canceled);
    }

    // =========================================================================
    // invoice.payment_failed then invoice.paid:
    // active → past_due → active, access granted throughout.
    // =========================================================================
    #[tokio::test]
    async fn payment_failure_grace_then_recovery() {
        let (h, account_id) = starter_harness().await;

        let failed = invoice_event("evt_inv_fail", "invoice.payment_failed", "cus_1", "sub_1", 4700);
        assert!(h.engine.ingest(failed).await.success);
        settle().await;

        let account = h.accounts.get(account_id).unwrap();
        assert_eq!(account.status, SubscriptionStatus::PastDue);
        assert!(account.access_granted, "not cut off on first failure");
        assert_eq!(account.tier, SubscriptionTier::Starter);
        assert_eq!(h.sink.count_of("payment-failed"), 1);

        let paid = invoice_event("evt_inv_paid", "invoice.paid", "cus_1", "sub_1", 4700);
        assert!(h.engine.ingest(paid).await.success);

        let account = h.accounts.get(account_id).unwrap();
        assert_eq!(account.status, SubscriptionStatus::Active);
        assert!(account.access_granted);
    }
}

mod retry_tests {
    use super::support::*;
    use crate::plans::{PlanCatalog, ResolvedPlan};
    use crate::store::{EventStatus, EventStore};
    use draftly_shared::SubscriptionTier;

    // =========================================================================
    // UnknownPlanError -> operator extends the catalog -> retry succeeds,
    // exactly one history entry, and a recovered notification fires.
    // =========================================================================
    #[tokio::test]
    async fn unknown_plan_recovers_after_catalog_fix() {
        let h = Harness::new();
        let account_id = h.accounts.seed_account("writer@example.com");
        h.engine
            .ingest(customer_created("evt_cus", "cus_1", "writer@example.com"))
            .await;

        let event = subscription_event(
            "evt_new_price",
            "customer.subscription.created",
            "sub_1",
            "cus_1",
            "price_vault_annual",
            "active",
            month_from_now(),
        );

        let first = h.engine.ingest(event).await;
        assert!(!first.success);
        assert!(first.error.unwrap().contains("unknown plan"));

        let record = h.events.get("evt_new_price").await.unwrap().unwrap();
        assert_eq!(record.status, EventStatus::Failed);
        assert_eq!(record.attempts, 1);

        // Operator maps the new price id and the service reloads.
        let mut fixed = PlanCatalog::builtin();
        fixed.insert(
            "price_vault_annual",
            ResolvedPlan {
                tier: SubscriptionTier::Vault,
                amount_cents: 297_000,
                currency: "usd",
                billing_interval: "year",
            },
        );
        let engine = h.engine_with_catalog(fixed);

        let retried = engine.retry("evt_new_price").await;
        settle().await;
        assert!(retried.success);

        let record = h.events.get("evt_new_price").await.unwrap().unwrap();
        assert_eq!(record.status, EventStatus::Processed);

        let history = h.history.all();
        assert_eq!(history.len(), 1, "exactly one entry after the recovery");
        assert_eq!(history[0].plan_name, "vault");

        let account = h.accounts.get(account_id).unwrap();
        assert_eq!(account.tier, SubscriptionTier::Vault);

        assert_eq!(h.sink.count_of("recovered"), 1);
    }

    #[tokio::test]
    async fn retry_of_processed_event_is_a_noop() {
        let h = Harness::new();
        h.accounts.seed_account("writer@example.com");
        h.engine
            .ingest(customer_created("evt_cus", "cus_1", "writer@example.com"))
            .await;
        let created = subscription_event(
            "evt_created",
            "customer.subscription.created",
            "sub_1",
            "cus_1",
            "price_starter",
            "active",
            month_from_now(),
        );
        assert!(h.engine.ingest(created).await.success);
        settle().await;
        let welcome_before = h.sink.count_of("welcome");

        let result = h.engine.retry("evt_created").await;
        settle().await;
        assert!(result.success);
        assert!(result.duplicate);
        assert_eq!(h.history.all().len(), 1);
        assert_eq!(h.sink.count_of("welcome"), welcome_before);
        assert_eq!(h.sink.count_of("recovered"), 0);
    }

    #[tokio::test]
    async fn retry_of_unknown_event_fails() {
        let h = Harness::new();
        let result = h.engine.retry("evt_never_seen").await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn retry_of_in_flight_event_is_rejected() {
        use crate::store::NewEvent;

        let h = Harness::new();
        // Seed a 'received' row directly, as if another worker were mid-flight.
        h.events
            .record_if_new(NewEvent {
                stripe_event_id: "evt_inflight".to_string(),
                event_type: "invoice.paid".to_string(),
                payload: serde_json::json!({}),
            })
            .await
            .unwrap();

        let result = h.engine.retry("evt_inflight").await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("cannot be retried"));
    }
}

mod reconstruction_tests {
    use super::support::*;
    use crate::history::fold;
    use draftly_shared::{SubscriptionStatus, SubscriptionTier};

    // =========================================================================
    // Folding the history left-to-right reproduces the account's current
    // tier / status / period end.
    // =========================================================================
    #[tokio::test]
    async fn history_fold_matches_account_state() {
        let h = Harness::new();
        let account_id = h.accounts.seed_account("writer@example.com");
        h.engine
            .ingest(customer_created("evt_cus", "cus_1", "writer@example.com"))
            .await;

        let period_end = month_from_now();
        let deliveries = vec![
            subscription_event(
                "evt_1",
                "customer.subscription.created",
                "sub_1",
                "cus_1",
                "price_starter",
                "active",
                period_end,
            ),
            subscription_event(
                "evt_2",
                "customer.subscription.updated",
                "sub_1",
                "cus_1",
                "price_pro",
                "active",
                period_end,
            ),
            invoice_event("evt_3", "invoice.payment_failed", "cus_1", "sub_1", 9700),
            invoice_event("evt_4", "invoice.paid", "cus_1", "sub_1", 9700),
        ];
        for event in deliveries {
            assert!(h.engine.ingest(event).await.success);
        }
        settle().await;

        let account = h.accounts.get(account_id).unwrap();
        assert_eq!(account.tier, SubscriptionTier::Pro);
        assert_eq!(account.status, SubscriptionStatus::Active);

        let entries = h.history.all();
        assert_eq!(entries.len(), 4);

        let reconstructed = fold(&entries).unwrap();
        assert_eq!(reconstructed.tier, account.tier);
        assert_eq!(reconstructed.status, account.status);
        assert_eq!(reconstructed.period_end, account.current_period_end);
    }
}
