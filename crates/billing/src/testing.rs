//! In-memory implementations of the storage and notification traits.
//!
//! Used by the engine scenario tests; also handy for driving the core in
//! examples and local tools without a database.

#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use draftly_shared::{SubscriptionStatus, SubscriptionTier};

use crate::accounts::{AccountPatch, AccountState, AccountStore, Entitlement};
use crate::error::{BillingError, BillingResult};
use crate::history::{HistoryDraft, HistoryEntry, HistoryStore};
use crate::notify::{NotificationRequest, NotificationSink};
use crate::store::{EventRecord, EventStatus, EventStore, NewEvent, RecordOutcome};

/// In-memory event store with the same claim semantics as the Postgres
/// implementation.
#[derive(Default)]
pub struct InMemoryEventStore {
    events: Mutex<HashMap<String, EventRecord>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn record_if_new(&self, event: NewEvent) -> BillingResult<RecordOutcome> {
        let mut events = self.events.lock().unwrap();
        if let Some(existing) = events.get_mut(&event.stripe_event_id) {
            let stale_cutoff = OffsetDateTime::now_utc()
                - time::Duration::minutes(i64::from(crate::store::PROCESSING_TIMEOUT_MINUTES));
            if existing.status == EventStatus::Received && existing.received_at < stale_cutoff {
                // Crash orphan: let the redelivery re-claim it.
                existing.received_at = OffsetDateTime::now_utc();
                return Ok(RecordOutcome {
                    is_new: true,
                    record: existing.clone(),
                });
            }
            return Ok(RecordOutcome {
                is_new: false,
                record: existing.clone(),
            });
        }

        let record = EventRecord {
            id: Uuid::new_v4(),
            stripe_event_id: event.stripe_event_id.clone(),
            event_type: event.event_type,
            payload: event.payload,
            status: EventStatus::Received,
            attempts: 0,
            last_error: None,
            received_at: OffsetDateTime::now_utc(),
            processed_at: None,
        };
        events.insert(event.stripe_event_id, record.clone());
        Ok(RecordOutcome {
            is_new: true,
            record,
        })
    }

    async fn mark_processed(&self, stripe_event_id: &str) -> BillingResult<()> {
        let mut events = self.events.lock().unwrap();
        if let Some(record) = events.get_mut(stripe_event_id) {
            if record.status != EventStatus::Processed {
                record.status = EventStatus::Processed;
                record.processed_at = Some(OffsetDateTime::now_utc());
                record.last_error = None;
            }
        }
        Ok(())
    }

    async fn mark_failed(&self, stripe_event_id: &str, error: &str) -> BillingResult<()> {
        let mut events = self.events.lock().unwrap();
        if let Some(record) = events.get_mut(stripe_event_id) {
            if record.status != EventStatus::Processed {
                record.status = EventStatus::Failed;
                record.last_error = Some(error.to_string());
                record.attempts += 1;
            }
        }
        Ok(())
    }

    async fn claim_for_retry(&self, stripe_event_id: &str) -> BillingResult<Option<EventRecord>> {
        let mut events = self.events.lock().unwrap();
        match events.get_mut(stripe_event_id) {
            Some(record) if record.status == EventStatus::Failed => {
                record.status = EventStatus::Received;
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn get(&self, stripe_event_id: &str) -> BillingResult<Option<EventRecord>> {
        Ok(self.events.lock().unwrap().get(stripe_event_id).cloned())
    }

    async fn list_recent(&self, limit: i64) -> BillingResult<Vec<EventRecord>> {
        let events = self.events.lock().unwrap();
        let mut records: Vec<EventRecord> = events.values().cloned().collect();
        records.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        records.truncate(limit.max(0) as usize);
        Ok(records)
    }
}

/// In-memory account store.
#[derive(Default)]
pub struct InMemoryAccountStore {
    accounts: Mutex<HashMap<Uuid, AccountState>>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a fresh free-tier account and return its id.
    pub fn seed_account(&self, email: &str) -> Uuid {
        let id = Uuid::new_v4();
        let account = AccountState {
            id,
            email: email.to_string(),
            stripe_customer_id: None,
            stripe_subscription_id: None,
            tier: SubscriptionTier::Free,
            status: SubscriptionStatus::Incomplete,
            access_granted: false,
            current_period_end: None,
        };
        self.accounts.lock().unwrap().insert(id, account);
        id
    }

    pub fn get(&self, account_id: Uuid) -> Option<AccountState> {
        self.accounts.lock().unwrap().get(&account_id).cloned()
    }

    fn find(&self, pred: impl Fn(&AccountState) -> bool) -> Option<AccountState> {
        self.accounts
            .lock()
            .unwrap()
            .values()
            .find(|a| pred(a))
            .cloned()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn find_by_email(&self, email: &str) -> BillingResult<Option<AccountState>> {
        Ok(self.find(|a| a.email == email))
    }

    async fn find_by_customer_id(&self, customer_id: &str) -> BillingResult<Option<AccountState>> {
        Ok(self.find(|a| a.stripe_customer_id.as_deref() == Some(customer_id)))
    }

    async fn find_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<AccountState>> {
        Ok(self.find(|a| a.stripe_subscription_id.as_deref() == Some(subscription_id)))
    }

    async fn apply_patch(&self, account_id: Uuid, patch: &AccountPatch) -> BillingResult<()> {
        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts
            .get_mut(&account_id)
            .ok_or_else(|| BillingError::MissingAccount {
                lookup: format!("account id {account_id}"),
            })?;

        if let Some(customer_id) = &patch.stripe_customer_id {
            account.stripe_customer_id = Some(customer_id.clone());
        }
        if let Some(subscription_id) = &patch.stripe_subscription_id {
            account.stripe_subscription_id = Some(subscription_id.clone());
        }
        if let Some(tier) = patch.tier {
            account.tier = tier;
        }
        if let Some(status) = patch.status {
            account.status = status;
        }
        if let Some(access) = patch.access_granted {
            account.access_granted = access;
        }
        if let Some(period_end) = &patch.current_period_end {
            account.current_period_end = *period_end;
        }
        Ok(())
    }

    async fn entitlement(&self, account_id: Uuid) -> BillingResult<Option<Entitlement>> {
        Ok(self.get(account_id).map(|a| Entitlement {
            tier: a.tier,
            access_granted: a.access_granted,
        }))
    }
}

/// In-memory history store with the source-event uniqueness of the real
/// table.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    entries: Mutex<Vec<HistoryEntry>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<HistoryEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(&self, draft: HistoryDraft, source_event_id: &str) -> BillingResult<bool> {
        let mut entries = self.entries.lock().unwrap();
        if entries.iter().any(|e| e.source_event_id == source_event_id) {
            return Ok(false);
        }
        entries.push(HistoryEntry {
            id: Uuid::new_v4(),
            account_id: draft.account_id,
            stripe_subscription_id: draft.stripe_subscription_id,
            status: draft.status,
            plan_name: draft.plan_name,
            amount_cents: draft.amount_cents,
            currency: draft.currency,
            billing_interval: draft.billing_interval,
            period_start: draft.period_start,
            period_end: draft.period_end,
            canceled_at: draft.canceled_at,
            ended_at: draft.ended_at,
            source_event_id: source_event_id.to_string(),
            created_at: OffsetDateTime::now_utc(),
        });
        Ok(true)
    }

    async fn list_for_account(&self, account_id: Uuid) -> BillingResult<Vec<HistoryEntry>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect())
    }
}

/// Records every notification it is asked to send.
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<NotificationRequest>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<NotificationRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count_of(&self, kind: &str) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.kind() == kind)
            .count()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, request: &NotificationRequest) -> BillingResult<()> {
        self.sent.lock().unwrap().push(request.clone());
        Ok(())
    }
}
