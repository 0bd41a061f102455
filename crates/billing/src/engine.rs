//! Reconciliation engine: the only writer of event records, account
//! subscription state, and history.
//!
//! Per-event state machine:
//! `received → (dedup) → [short-circuit] → (handler) → processed | failed`.
//!
//! `ingest` and `retry` never propagate an error to the caller; every
//! failure is captured into the event record and a structured
//! `ProcessingResult`, so the HTTP layer can always answer the provider
//! with a well-formed response. Marking `processed` happens strictly after
//! the state patch and history append are durable: a crash in between
//! leaves the event unconfirmed and the provider's redelivery converges,
//! because handlers compute absolute state and history appends are keyed
//! by source event id.

use std::sync::Arc;

use time::OffsetDateTime;

use crate::accounts::{AccountState, AccountStore};
use crate::error::{BillingError, BillingResult};
use crate::events::{AccountLookup, EventKind, EventType, InboundEvent};
use crate::handlers;
use crate::history::HistoryStore;
use crate::notify::{NotificationRequest, NotificationSink};
use crate::plans::PlanCatalog;
use crate::store::{EventStatus, EventStore, NewEvent, RecordOutcome};

/// Structured result of one ingest or retry call.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessingResult {
    pub success: bool,
    pub event_id: String,
    pub event_type: String,
    /// True when this delivery was deduplicated against an earlier one.
    pub duplicate: bool,
    pub error: Option<String>,
}

impl ProcessingResult {
    fn ok(event_id: impl Into<String>, event_type: impl Into<String>, duplicate: bool) -> Self {
        ProcessingResult {
            success: true,
            event_id: event_id.into(),
            event_type: event_type.into(),
            duplicate,
            error: None,
        }
    }

    fn rejected(
        event_id: impl Into<String>,
        event_type: impl Into<String>,
        duplicate: bool,
        error: String,
    ) -> Self {
        ProcessingResult {
            success: false,
            event_id: event_id.into(),
            event_type: event_type.into(),
            duplicate,
            error: Some(error),
        }
    }
}

/// Orchestrates dedup, handler dispatch, commit, and notification
/// dispatch.
#[derive(Clone)]
pub struct ReconciliationEngine {
    events: Arc<dyn EventStore>,
    accounts: Arc<dyn AccountStore>,
    history: Arc<dyn HistoryStore>,
    catalog: Arc<PlanCatalog>,
    notifier: Arc<dyn NotificationSink>,
}

impl ReconciliationEngine {
    pub fn new(
        events: Arc<dyn EventStore>,
        accounts: Arc<dyn AccountStore>,
        history: Arc<dyn HistoryStore>,
        catalog: Arc<PlanCatalog>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            events,
            accounts,
            history,
            catalog,
            notifier,
        }
    }

    /// Ingest one webhook delivery.
    pub async fn ingest(&self, event: InboundEvent) -> ProcessingResult {
        // Unrecognized event types never reach the store; the webhook
        // subscription should be narrowed to the handled types.
        if let Err(e) = event.event_type.parse::<EventType>() {
            tracing::warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Rejecting unrecognized event type before dedup"
            );
            return ProcessingResult::rejected(event.id, event.event_type, false, e.to_string());
        }

        let outcome = match self
            .events
            .record_if_new(NewEvent {
                stripe_event_id: event.id.clone(),
                event_type: event.event_type.clone(),
                payload: event.data.clone(),
            })
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(event_id = %event.id, error = %e, "Failed to record event");
                return ProcessingResult::rejected(
                    event.id,
                    event.event_type,
                    false,
                    e.to_string(),
                );
            }
        };

        if !outcome.is_new {
            return self.short_circuit(outcome);
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing webhook event (claimed via atomic insert)"
        );

        self.drive(outcome.record.stripe_event_id, outcome.record.event_type, outcome.record.payload, None)
            .await
    }

    /// Operator re-drive of a previously failed event.
    ///
    /// Replays the stored verbatim payload; the provider is never asked to
    /// re-send, so the re-drive is faithful regardless of the provider's
    /// event retention window.
    pub async fn retry(&self, stripe_event_id: &str) -> ProcessingResult {
        let record = match self.events.get(stripe_event_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                let err = BillingError::EventNotFound(stripe_event_id.to_string());
                return ProcessingResult::rejected(stripe_event_id, "", false, err.to_string());
            }
            Err(e) => {
                return ProcessingResult::rejected(stripe_event_id, "", false, e.to_string());
            }
        };

        match record.status {
            EventStatus::Processed => {
                tracing::info!(event_id = %stripe_event_id, "Retry of processed event is a no-op");
                ProcessingResult::ok(stripe_event_id, record.event_type, true)
            }
            EventStatus::Received => {
                let err = BillingError::NotRetriable {
                    event_id: stripe_event_id.to_string(),
                    status: record.status.to_string(),
                };
                ProcessingResult::rejected(
                    stripe_event_id,
                    record.event_type,
                    false,
                    err.to_string(),
                )
            }
            EventStatus::Failed => {
                let claimed = match self.events.claim_for_retry(stripe_event_id).await {
                    Ok(Some(record)) => record,
                    Ok(None) => {
                        // Lost the claim to a concurrent retry (or the event
                        // just got processed).
                        let err = BillingError::NotRetriable {
                            event_id: stripe_event_id.to_string(),
                            status: "contended".to_string(),
                        };
                        return ProcessingResult::rejected(
                            stripe_event_id,
                            record.event_type,
                            false,
                            err.to_string(),
                        );
                    }
                    Err(e) => {
                        return ProcessingResult::rejected(
                            stripe_event_id,
                            record.event_type,
                            false,
                            e.to_string(),
                        );
                    }
                };

                tracing::info!(
                    event_id = %stripe_event_id,
                    prior_attempts = claimed.attempts,
                    prior_error = ?claimed.last_error,
                    "Replaying failed event from stored payload"
                );

                self.drive(
                    claimed.stripe_event_id,
                    claimed.event_type,
                    claimed.payload,
                    Some(claimed.attempts),
                )
                .await
            }
        }
    }

    fn short_circuit(&self, outcome: RecordOutcome) -> ProcessingResult {
        let record = outcome.record;
        match record.status {
            EventStatus::Processed => {
                tracing::info!(
                    event_id = %record.stripe_event_id,
                    event_type = %record.event_type,
                    "Duplicate delivery of processed event"
                );
                ProcessingResult::ok(record.stripe_event_id, record.event_type, true)
            }
            EventStatus::Received => {
                // Another delivery claimed the insert milliseconds ago and
                // is still running; acknowledge and let it finish.
                tracing::info!(
                    event_id = %record.stripe_event_id,
                    "Duplicate delivery while original is in flight"
                );
                ProcessingResult::ok(record.stripe_event_id, record.event_type, true)
            }
            EventStatus::Failed => {
                // Redelivery of a failed event does not re-run the handler;
                // re-driving is the operator's explicit retry action.
                let error = record
                    .last_error
                    .unwrap_or_else(|| "previously failed".to_string());
                ProcessingResult::rejected(record.stripe_event_id, record.event_type, true, error)
            }
        }
    }

    /// Run the handler pipeline for a claimed event and record the result.
    async fn drive(
        &self,
        stripe_event_id: String,
        event_type: String,
        payload: serde_json::Value,
        recovered_after: Option<i32>,
    ) -> ProcessingResult {
        match self.run_pipeline(&stripe_event_id, &event_type, &payload).await {
            Ok(mut notifications) => {
                if let Err(e) = self.events.mark_processed(&stripe_event_id).await {
                    // State and history are committed; only the event row is
                    // stale. The provider's redelivery will converge it.
                    tracing::error!(
                        event_id = %stripe_event_id,
                        error = %e,
                        "State committed but event could not be marked processed"
                    );
                    return ProcessingResult::rejected(
                        stripe_event_id,
                        event_type,
                        false,
                        e.to_string(),
                    );
                }

                if let Some(attempts) = recovered_after {
                    if attempts > 0 {
                        notifications.push(NotificationRequest::Recovered {
                            stripe_event_id: stripe_event_id.clone(),
                            event_type: event_type.clone(),
                            attempts,
                        });
                    }
                }

                self.dispatch_notifications(&stripe_event_id, notifications);

                tracing::info!(
                    event_id = %stripe_event_id,
                    event_type = %event_type,
                    "Event processed"
                );
                ProcessingResult::ok(stripe_event_id, event_type, false)
            }
            Err(e) => {
                tracing::warn!(
                    event_id = %stripe_event_id,
                    event_type = %event_type,
                    error = %e,
                    "Event processing failed"
                );
                let stored = format!("{}: {}", e.code(), e);
                if let Err(mark_err) = self.events.mark_failed(&stripe_event_id, &stored).await {
                    tracing::error!(
                        event_id = %stripe_event_id,
                        error = %mark_err,
                        "Failed to record event failure"
                    );
                }
                ProcessingResult::rejected(stripe_event_id, event_type, false, e.to_string())
            }
        }
    }

    async fn run_pipeline(
        &self,
        stripe_event_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> BillingResult<Vec<NotificationRequest>> {
        let event_type: EventType = event_type.parse()?;
        let kind = EventKind::decode(event_type, payload)?;
        let account = self.lookup_account(&kind).await?;

        let now = OffsetDateTime::now_utc();
        let outcome = handlers::apply_event(&kind, account.as_ref(), &self.catalog, now)?;

        if let Some(reason) = outcome.noop {
            tracing::info!(
                event_id = %stripe_event_id,
                event_type = %event_type,
                reason = %reason,
                "Event processed as no-op"
            );
        }

        if let (Some(account_id), Some(patch)) = (outcome.account_id, outcome.patch.as_ref()) {
            if !patch.is_empty() {
                self.accounts.apply_patch(account_id, patch).await?;
            }
        }

        if let Some(draft) = outcome.history {
            let inserted = self.history.append(draft, stripe_event_id).await?;
            if !inserted {
                tracing::info!(
                    event_id = %stripe_event_id,
                    "History entry already present for this event (replay)"
                );
            }
        }

        Ok(outcome.notifications)
    }

    async fn lookup_account(&self, kind: &EventKind) -> BillingResult<Option<AccountState>> {
        match kind.lookup() {
            AccountLookup::ByEmail(None) => Ok(None),
            AccountLookup::ByEmail(Some(email)) => self.accounts.find_by_email(email).await,
            AccountLookup::ByCustomer {
                customer_id,
                subscription_id,
            } => {
                if let Some(customer_id) = customer_id {
                    if let Some(account) = self.accounts.find_by_customer_id(customer_id).await? {
                        return Ok(Some(account));
                    }
                }
                if let Some(subscription_id) = subscription_id {
                    if let Some(account) = self
                        .accounts
                        .find_by_subscription_id(subscription_id)
                        .await?
                    {
                        return Ok(Some(account));
                    }
                }
                Ok(None)
            }
        }
    }

    /// Fire-and-forget notification dispatch, offloaded so a slow sink
    /// cannot hold the webhook response. Failures are logged only.
    fn dispatch_notifications(&self, stripe_event_id: &str, requests: Vec<NotificationRequest>) {
        if requests.is_empty() {
            return;
        }
        let sink = Arc::clone(&self.notifier);
        let event_id = stripe_event_id.to_string();
        tokio::spawn(async move {
            for request in requests {
                if let Err(e) = sink.send(&request).await {
                    tracing::error!(
                        event_id = %event_id,
                        kind = request.kind(),
                        error = %e,
                        "Notification dispatch failed"
                    );
                }
            }
        });
    }
}
