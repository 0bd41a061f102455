//! Append-only subscription history.
//!
//! One entry per processed event that changed entitlement state (plus
//! audit-only entries for payments). Entries record the absolute
//! post-event state, so folding an account's entries left-to-right
//! reconstructs its current tier, status, and period end.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use draftly_shared::{SubscriptionStatus, SubscriptionTier};

use crate::error::{BillingError, BillingResult};

/// A written history entry. Immutable once appended.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub account_id: Uuid,
    pub stripe_subscription_id: Option<String>,
    pub status: SubscriptionStatus,
    pub plan_name: String,
    pub amount_cents: i64,
    pub currency: String,
    pub billing_interval: Option<String>,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
    pub ended_at: Option<OffsetDateTime>,
    pub source_event_id: String,
    pub created_at: OffsetDateTime,
}

/// An entry produced by a handler, before the engine stamps the source
/// event id.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryDraft {
    pub account_id: Uuid,
    pub stripe_subscription_id: Option<String>,
    pub status: SubscriptionStatus,
    pub plan_name: String,
    pub amount_cents: i64,
    pub currency: String,
    pub billing_interval: Option<String>,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
    pub ended_at: Option<OffsetDateTime>,
}

/// Storage contract for the audit trail. Append-only by construction:
/// there is no update or delete operation.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append an entry attributed to its source event. Returns `false`
    /// when an entry for that event already exists (crash replay), which
    /// is not an error.
    async fn append(&self, draft: HistoryDraft, source_event_id: &str) -> BillingResult<bool>;

    /// All entries for an account, oldest first.
    async fn list_for_account(&self, account_id: Uuid) -> BillingResult<Vec<HistoryEntry>>;
}

/// Entitlement state reconstructed by folding history entries.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructedState {
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub period_end: Option<OffsetDateTime>,
}

/// Fold an account's ordered history left-to-right.
///
/// Entries carry absolute post-event state, so each one overwrites the
/// accumulator; a missing period end (audit-only invoice entries) carries
/// the last known one forward. Returns `None` for an account with no
/// history.
pub fn fold(entries: &[HistoryEntry]) -> Option<ReconstructedState> {
    entries.iter().fold(None, |state: Option<ReconstructedState>, entry| {
        let tier = entry
            .plan_name
            .parse::<SubscriptionTier>()
            .unwrap_or(SubscriptionTier::Free);
        let period_end = entry
            .period_end
            .or_else(|| state.as_ref().and_then(|s| s.period_end));
        Some(ReconstructedState {
            tier,
            status: entry.status,
            period_end,
        })
    })
}

impl ReconstructedState {
    /// Apply the grace-period expiry rule at `now`.
    ///
    /// This is the same rule the worker sweep enforces: a canceled
    /// subscription keeps its tier until the paid period elapses.
    pub fn resolved_at(&self, now: OffsetDateTime) -> ReconstructedState {
        if self.status == SubscriptionStatus::Canceled
            && self.period_end.map(|pe| pe <= now).unwrap_or(true)
        {
            return ReconstructedState {
                tier: SubscriptionTier::Free,
                status: SubscriptionStatus::Canceled,
                period_end: self.period_end,
            };
        }
        self.clone()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct HistoryRow {
    id: Uuid,
    account_id: Uuid,
    stripe_subscription_id: Option<String>,
    status: String,
    plan_name: String,
    amount_cents: i32,
    currency: String,
    billing_interval: Option<String>,
    period_start: Option<OffsetDateTime>,
    period_end: Option<OffsetDateTime>,
    canceled_at: Option<OffsetDateTime>,
    ended_at: Option<OffsetDateTime>,
    source_event_id: String,
    created_at: OffsetDateTime,
}

impl TryFrom<HistoryRow> for HistoryEntry {
    type Error = BillingError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<SubscriptionStatus>()
            .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(HistoryEntry {
            id: row.id,
            account_id: row.account_id,
            stripe_subscription_id: row.stripe_subscription_id,
            status,
            plan_name: row.plan_name,
            amount_cents: i64::from(row.amount_cents),
            currency: row.currency,
            billing_interval: row.billing_interval,
            period_start: row.period_start,
            period_end: row.period_end,
            canceled_at: row.canceled_at,
            ended_at: row.ended_at,
            source_event_id: row.source_event_id,
            created_at: row.created_at,
        })
    }
}

/// Postgres-backed history store.
#[derive(Clone)]
pub struct PgHistoryStore {
    pool: PgPool,
}

impl PgHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    async fn append(&self, draft: HistoryDraft, source_event_id: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO subscription_history (
                account_id, stripe_subscription_id, status, plan_name,
                amount_cents, currency, billing_interval,
                period_start, period_end, canceled_at, ended_at,
                source_event_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (source_event_id) DO NOTHING
            "#,
        )
        .bind(draft.account_id)
        .bind(draft.stripe_subscription_id.as_deref())
        .bind(draft.status.as_str())
        .bind(&draft.plan_name)
        .bind(draft.amount_cents as i32)
        .bind(&draft.currency)
        .bind(draft.billing_interval.as_deref())
        .bind(draft.period_start)
        .bind(draft.period_end)
        .bind(draft.canceled_at)
        .bind(draft.ended_at)
        .bind(source_event_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_for_account(&self, account_id: Uuid) -> BillingResult<Vec<HistoryEntry>> {
        let rows: Vec<HistoryRow> = sqlx::query_as(
            r#"
            SELECT id, account_id, stripe_subscription_id, status, plan_name,
                   amount_cents, currency, billing_interval,
                   period_start, period_end, canceled_at, ended_at,
                   source_event_id, created_at
            FROM subscription_history
            WHERE account_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(HistoryEntry::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn entry(
        plan: &str,
        status: SubscriptionStatus,
        period_end: Option<OffsetDateTime>,
    ) -> HistoryEntry {
        HistoryEntry {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            stripe_subscription_id: Some("sub_1".to_string()),
            status,
            plan_name: plan.to_string(),
            amount_cents: 4700,
            currency: "usd".to_string(),
            billing_interval: Some("month".to_string()),
            period_start: None,
            period_end,
            canceled_at: None,
            ended_at: None,
            source_event_id: format!("evt_{}", Uuid::new_v4()),
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn fold_of_empty_history_is_none() {
        assert!(fold(&[]).is_none());
    }

    #[test]
    fn fold_takes_the_last_absolute_state() {
        let now = OffsetDateTime::UNIX_EPOCH + Duration::days(20_000);
        let entries = vec![
            entry("starter", SubscriptionStatus::Active, Some(now)),
            entry("pro", SubscriptionStatus::Active, Some(now)),
            entry("pro", SubscriptionStatus::PastDue, Some(now)),
        ];
        let state = fold(&entries).unwrap();
        assert_eq!(state.tier, SubscriptionTier::Pro);
        assert_eq!(state.status, SubscriptionStatus::PastDue);
        assert_eq!(state.period_end, Some(now));
    }

    #[test]
    fn resolved_at_keeps_grace_until_period_end() {
        let period_end = OffsetDateTime::UNIX_EPOCH + Duration::days(100);
        let canceled = ReconstructedState {
            tier: SubscriptionTier::Starter,
            status: SubscriptionStatus::Canceled,
            period_end: Some(period_end),
        };

        let during_grace = canceled.resolved_at(period_end - Duration::days(1));
        assert_eq!(during_grace.tier, SubscriptionTier::Starter);

        let after_grace = canceled.resolved_at(period_end + Duration::days(1));
        assert_eq!(after_grace.tier, SubscriptionTier::Free);
    }

    #[test]
    fn resolved_at_leaves_active_subscriptions_alone() {
        let state = ReconstructedState {
            tier: SubscriptionTier::Vault,
            status: SubscriptionStatus::Active,
            period_end: None,
        };
        assert_eq!(state.resolved_at(OffsetDateTime::UNIX_EPOCH), state);
    }
}
