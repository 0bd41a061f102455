//! Append-only webhook event store.
//!
//! Every delivery is recorded verbatim before any handler runs. The
//! uniqueness constraint on `stripe_event_id` is the single serialization
//! point for concurrent deliveries of the same event; an in-process lock
//! would not survive multiple instances behind a load balancer, so the
//! atomic conditional insert lives at the storage layer.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Processing status of a stored event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Received,
    Processed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Received => "received",
            EventStatus::Processed => "processed",
            EventStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for EventStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(EventStatus::Received),
            "processed" => Ok(EventStatus::Processed),
            "failed" => Ok(EventStatus::Failed),
            other => Err(BillingError::Database(format!(
                "unrecognized event status '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored webhook event.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: EventStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub received_at: OffsetDateTime,
    pub processed_at: Option<OffsetDateTime>,
}

/// A delivery about to be recorded.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub stripe_event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// Result of the atomic dedup insert.
#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub is_new: bool,
    pub record: EventRecord,
}

/// Storage contract for event records.
///
/// The engine is the only writer; the operator surface reads through
/// `get` / `list_recent`.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically record a delivery, or return the existing record when the
    /// event id was seen before. Never creates a duplicate. A `received`
    /// row older than the processing timeout is handed back as new: that is
    /// how a crash orphan gets re-driven by the provider's redelivery.
    async fn record_if_new(&self, event: NewEvent) -> BillingResult<RecordOutcome>;

    /// Transition to `processed`. Refuses to regress an already processed
    /// row.
    async fn mark_processed(&self, stripe_event_id: &str) -> BillingResult<()>;

    /// Transition to `failed`, recording the error and bumping the attempt
    /// counter.
    async fn mark_failed(&self, stripe_event_id: &str, error: &str) -> BillingResult<()>;

    /// Atomically flip a `failed` event back to `received` for a re-drive.
    /// Returns `None` when the event is not currently retriable (missing,
    /// processed, or claimed by a concurrent retry).
    async fn claim_for_retry(&self, stripe_event_id: &str) -> BillingResult<Option<EventRecord>>;

    async fn get(&self, stripe_event_id: &str) -> BillingResult<Option<EventRecord>>;

    /// Recent events, newest first.
    async fn list_recent(&self, limit: i64) -> BillingResult<Vec<EventRecord>>;
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    stripe_event_id: String,
    event_type: String,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    received_at: OffsetDateTime,
    processed_at: Option<OffsetDateTime>,
}

impl TryFrom<EventRow> for EventRecord {
    type Error = BillingError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(EventRecord {
            status: row.status.parse()?,
            id: row.id,
            stripe_event_id: row.stripe_event_id,
            event_type: row.event_type,
            payload: row.payload,
            attempts: row.attempts,
            last_error: row.last_error,
            received_at: row.received_at,
            processed_at: row.processed_at,
        })
    }
}

const EVENT_COLUMNS: &str = "id, stripe_event_id, event_type, payload, status, attempts, \
     last_error, received_at, processed_at";

/// A `received` row older than this is treated as a crash orphan: the next
/// delivery of the same event may re-claim it instead of short-circuiting.
pub const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// Postgres-backed event store.
#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn record_if_new(&self, event: NewEvent) -> BillingResult<RecordOutcome> {
        // INSERT ... ON CONFLICT ... RETURNING yields a row only for the
        // delivery that won the claim: a fresh event id, or a `received`
        // row stuck past the processing timeout (crash orphan the provider
        // is redelivering). Losers fall through to a plain read of the
        // winner's row.
        let inserted: Option<EventRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO stripe_webhook_events (stripe_event_id, event_type, payload, status)
            VALUES ($1, $2, $3, 'received')
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                received_at = NOW(),
                last_error = CONCAT('Re-claimed from stale state at ', NOW()::TEXT)
            WHERE stripe_webhook_events.status = 'received'
              AND stripe_webhook_events.received_at < NOW() - ($4 || ' minutes')::INTERVAL
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(&event.stripe_event_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(RecordOutcome {
                is_new: true,
                record: row.try_into()?,
            });
        }

        let existing = self
            .get(&event.stripe_event_id)
            .await?
            .ok_or_else(|| BillingError::EventNotFound(event.stripe_event_id.clone()))?;

        Ok(RecordOutcome {
            is_new: false,
            record: existing,
        })
    }

    async fn mark_processed(&self, stripe_event_id: &str) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET status = 'processed', processed_at = NOW(), last_error = NULL
            WHERE stripe_event_id = $1 AND status <> 'processed'
            "#,
        )
        .bind(stripe_event_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::debug!(
                event_id = %stripe_event_id,
                "mark_processed touched no rows (already processed or unknown)"
            );
        }
        Ok(())
    }

    async fn mark_failed(&self, stripe_event_id: &str, error: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET status = 'failed', last_error = $2, attempts = attempts + 1
            WHERE stripe_event_id = $1 AND status <> 'processed'
            "#,
        )
        .bind(stripe_event_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_for_retry(&self, stripe_event_id: &str) -> BillingResult<Option<EventRecord>> {
        let row: Option<EventRow> = sqlx::query_as(&format!(
            r#"
            UPDATE stripe_webhook_events
            SET status = 'received'
            WHERE stripe_event_id = $1 AND status = 'failed'
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(stripe_event_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(EventRecord::try_from).transpose()
    }

    async fn get(&self, stripe_event_id: &str) -> BillingResult<Option<EventRecord>> {
        let row: Option<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM stripe_webhook_events WHERE stripe_event_id = $1"
        ))
        .bind(stripe_event_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(EventRecord::try_from).transpose()
    }

    async fn list_recent(&self, limit: i64) -> BillingResult<Vec<EventRecord>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM stripe_webhook_events
            ORDER BY received_at DESC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventRecord::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn status_round_trips() {
        for status in [
            EventStatus::Received,
            EventStatus::Processed,
            EventStatus::Failed,
        ] {
            assert_eq!(EventStatus::from_str(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_is_a_database_error() {
        let err = EventStatus::from_str("replaying").unwrap_err();
        assert_eq!(err.code(), "database");
    }
}
