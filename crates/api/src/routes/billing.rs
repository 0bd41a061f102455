//! Webhook ingestion and operator endpoints.
//!
//! Response-code policy: a recognized event always answers 200, with
//! `success: false` in the body when the handler failed, so the provider's
//! retry loop cannot hammer a permanent error. Only transport/parse
//! failures before the event store return non-2xx.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use draftly_billing::{
    AccountStore, Entitlement, EventRecord, EventStore, HistoryEntry, HistoryStore, InboundEvent,
    ProcessingResult,
};

use crate::error::ApiError;
use crate::state::AppState;

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /webhooks/stripe
///
/// The body is the already signature-verified, deserialized event
/// envelope; verification happens upstream of this service.
pub async fn ingest_webhook(
    State(state): State<AppState>,
    Json(event): Json<InboundEvent>,
) -> Result<Json<ProcessingResult>, ApiError> {
    if event.id.is_empty() {
        return Err(ApiError::BadRequest("event id must not be empty".to_string()));
    }

    // Unknown event types are a pre-dedup parse failure: reject non-2xx so
    // the subscription misconfiguration is visible at the provider.
    event
        .event_type
        .parse::<draftly_billing::EventType>()
        .map_err(|_| ApiError::UnrecognizedEventType(event.event_type.clone()))?;

    let result = state.core.engine.ingest(event).await;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct ListEventsParams {
    pub limit: Option<i64>,
}

/// GET /billing/events?limit=N: recent event records, newest first.
pub async fn list_events(
    State(state): State<AppState>,
    Query(params): Query<ListEventsParams>,
) -> Result<Json<Vec<EventRecord>>, ApiError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 200);
    let records = state.core.events.list_recent(limit).await?;
    Ok(Json(records))
}

/// POST /billing/events/{id}/retry: operator re-drive of a failed event.
pub async fn retry_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProcessingResult>, ApiError> {
    // 404 for ids we have never seen; everything else is a 200 with the
    // structured result.
    if state.core.events.get(&id).await?.is_none() {
        return Err(ApiError::NotFound(format!("event {id} not found")));
    }

    let result = state.core.engine.retry(&id).await;
    Ok(Json(result))
}

/// GET /accounts/{id}/history: ordered subscription history entries.
pub async fn account_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    let entries = state.core.history.list_for_account(id).await?;
    Ok(Json(entries))
}

/// GET /accounts/{id}/entitlement: the narrow read for the quota service.
pub async fn account_entitlement(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Entitlement>, ApiError> {
    let entitlement = state
        .core
        .accounts
        .entitlement(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("account {id} not found")))?;
    Ok(Json(entitlement))
}
