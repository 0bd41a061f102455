//! Route registration.

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub mod billing;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(billing::health))
        .route("/webhooks/stripe", post(billing::ingest_webhook))
        .route("/billing/events", get(billing::list_events))
        .route("/billing/events/{id}/retry", post(billing::retry_event))
        .route("/accounts/{id}/history", get(billing::account_history))
        .route("/accounts/{id}/entitlement", get(billing::account_entitlement))
        .with_state(state)
}
