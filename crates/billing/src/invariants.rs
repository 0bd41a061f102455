//! Runnable consistency checks for the reconciliation core.
//!
//! Each invariant is a real SQL query an operator can run after a replay
//! or a suspicious incident. Checks only read, never write, and every
//! violation carries enough context to debug.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// A single invariant violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated.
    pub invariant: String,
    /// Affected account ids (empty for event-level violations).
    pub account_ids: Vec<Uuid>,
    /// Human-readable description.
    pub description: String,
    /// Additional context for debugging.
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Entitlements may be wrong right now.
    Critical,
    /// Data inconsistency that needs attention.
    High,
    /// Should investigate.
    Medium,
    /// Informational.
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of a full check run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct TierAccessRow {
    account_id: Uuid,
    email: String,
    subscription_tier: String,
    subscription_status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct CanceledNoPeriodEndRow {
    account_id: Uuid,
    email: String,
}

#[derive(Debug, sqlx::FromRow)]
struct EventWithoutTimestampRow {
    stripe_event_id: String,
    event_type: String,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckEventRow {
    stripe_event_id: String,
    event_type: String,
    received_at: OffsetDateTime,
}

/// Service running the invariant checks.
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all checks and return a summary.
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_free_when_access_revoked().await?);
        violations.extend(self.check_canceled_has_period_end().await?);
        violations.extend(self.check_processed_has_timestamp().await?);
        violations.extend(self.check_no_stale_received_events().await?);

        let checks_run = 4;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: tier is `free` whenever access is revoked.
    ///
    /// The only sanctioned exception is the `past_due` grace window, where
    /// the prior tier is retained.
    async fn check_free_when_access_revoked(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<TierAccessRow> = sqlx::query_as(
            r#"
            SELECT id AS account_id, email, subscription_tier, subscription_status
            FROM accounts
            WHERE access_granted = FALSE
              AND subscription_tier <> 'free'
              AND subscription_status <> 'past_due'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "free_when_access_revoked".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Account '{}' has tier '{}' with access revoked (status '{}')",
                    row.email, row.subscription_tier, row.subscription_status
                ),
                context: serde_json::json!({
                    "tier": row.subscription_tier,
                    "status": row.subscription_status,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: canceled subscriptions still granting access need a
    /// period end, otherwise the sweep can never revoke them.
    async fn check_canceled_has_period_end(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CanceledNoPeriodEndRow> = sqlx::query_as(
            r#"
            SELECT id AS account_id, email
            FROM accounts
            WHERE subscription_status = 'canceled'
              AND access_granted = TRUE
              AND current_period_end IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "canceled_has_period_end".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Account '{}' is canceled with access but has no period end; \
                     the sweep cannot revoke it",
                    row.email
                ),
                context: serde_json::json!({}),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: processed events carry a processed_at timestamp.
    async fn check_processed_has_timestamp(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<EventWithoutTimestampRow> = sqlx::query_as(
            r#"
            SELECT stripe_event_id, event_type
            FROM stripe_webhook_events
            WHERE status = 'processed' AND processed_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "processed_has_timestamp".to_string(),
                account_ids: vec![],
                description: format!(
                    "Event '{}' ({}) is processed without a processed_at timestamp",
                    row.stripe_event_id, row.event_type
                ),
                context: serde_json::json!({ "event_type": row.event_type }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 4: no event sits in `received` for more than 30 minutes.
    ///
    /// A stale `received` row means a crash mid-processing; the provider's
    /// redelivery should have converged it by now.
    async fn check_no_stale_received_events(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckEventRow> = sqlx::query_as(
            r#"
            SELECT stripe_event_id, event_type, received_at
            FROM stripe_webhook_events
            WHERE status = 'received'
              AND received_at < NOW() - INTERVAL '30 minutes'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stale_received_events".to_string(),
                account_ids: vec![],
                description: format!(
                    "Event '{}' ({}) has been 'received' since {}",
                    row.stripe_event_id, row.event_type, row.received_at
                ),
                context: serde_json::json!({
                    "event_type": row.event_type,
                    "received_at": row.received_at.to_string(),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single check by name.
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "free_when_access_revoked" => self.check_free_when_access_revoked().await,
            "canceled_has_period_end" => self.check_canceled_has_period_end().await,
            "processed_has_timestamp" => self.check_processed_has_timestamp().await,
            "no_stale_received_events" => self.check_no_stale_received_events().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "free_when_access_revoked",
            "canceled_has_period_end",
            "processed_has_timestamp",
            "no_stale_received_events",
        ]
    }
}
