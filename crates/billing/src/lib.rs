// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Draftly Billing Reconciliation Core
//!
//! Ingests Stripe webhook events, applies each exactly once to account
//! entitlement state despite at-least-once delivery, and keeps an
//! append-only subscription history that can be folded to reconstruct an
//! account's entitlements.
//!
//! ## Structure
//!
//! - **Event Store**: verbatim record of every delivery, with the atomic
//!   dedup insert as the single serialization point
//! - **Plan Catalog**: pure price-id → tier resolution
//! - **Event Handlers**: pure transition functions, no I/O
//! - **Reconciliation Engine**: dedup, dispatch, commit, failure capture,
//!   operator retry
//! - **Notification Dispatch**: best-effort, decoupled from billing state

pub mod accounts;
pub mod engine;
pub mod error;
pub mod events;
pub mod handlers;
pub mod history;
pub mod invariants;
pub mod notify;
pub mod plans;
pub mod store;
pub mod testing;

#[cfg(test)]
mod edge_case_tests;

// Accounts
pub use accounts::{AccountPatch, AccountState, AccountStore, Entitlement, PgAccountStore};

// Engine
pub use engine::{ProcessingResult, ReconciliationEngine};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{EventKind, EventType, InboundEvent};

// History
pub use history::{fold, HistoryEntry, HistoryStore, PgHistoryStore, ReconstructedState};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Notifications
pub use notify::{EmailNotifier, NotificationRequest, NotificationSink};

// Plans
pub use plans::{PlanCatalog, ResolvedPlan};

// Store
pub use store::{EventRecord, EventStatus, EventStore, PgEventStore};

use std::sync::Arc;

use sqlx::PgPool;

/// Everything the HTTP surface needs, assembled over Postgres.
#[derive(Clone)]
pub struct BillingCore {
    pub engine: ReconciliationEngine,
    pub events: Arc<dyn EventStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub history: Arc<dyn HistoryStore>,
}

impl BillingCore {
    /// Assemble the core from environment configuration.
    pub fn from_env(pool: PgPool) -> Self {
        Self::new(
            pool,
            PlanCatalog::from_env(),
            Arc::new(EmailNotifier::from_env()),
        )
    }

    pub fn new(pool: PgPool, catalog: PlanCatalog, notifier: Arc<dyn NotificationSink>) -> Self {
        let events: Arc<dyn EventStore> = Arc::new(PgEventStore::new(pool.clone()));
        let accounts: Arc<dyn AccountStore> = Arc::new(PgAccountStore::new(pool.clone()));
        let history: Arc<dyn HistoryStore> = Arc::new(PgHistoryStore::new(pool));

        let engine = ReconciliationEngine::new(
            Arc::clone(&events),
            Arc::clone(&accounts),
            Arc::clone(&history),
            Arc::new(catalog),
            notifier,
        );

        Self {
            engine,
            events,
            accounts,
            history,
        }
    }
}
