//! Account subscription state and the narrow update contract.
//!
//! The reconciliation engine is the only writer of these fields. Everything
//! else (the quota service in particular) reads through `entitlement`,
//! which exposes exactly the tier and access flag and nothing more.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use draftly_shared::{SubscriptionStatus, SubscriptionTier};

use crate::error::{BillingError, BillingResult};

/// The billing-owned subset of an account, as read by handlers.
#[derive(Debug, Clone)]
pub struct AccountState {
    pub id: Uuid,
    pub email: String,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub access_granted: bool,
    pub current_period_end: Option<OffsetDateTime>,
}

/// Declarative state update produced by a handler.
///
/// Unset fields are left untouched. `current_period_end` is doubly
/// optional so a patch can distinguish "leave as is" from "clear".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountPatch {
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub tier: Option<SubscriptionTier>,
    pub status: Option<SubscriptionStatus>,
    pub access_granted: Option<bool>,
    pub current_period_end: Option<Option<OffsetDateTime>>,
}

impl AccountPatch {
    pub fn is_empty(&self) -> bool {
        *self == AccountPatch::default()
    }
}

/// The read surface downstream consumers are allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Entitlement {
    pub tier: SubscriptionTier,
    pub access_granted: bool,
}

/// Account lookup and the narrow update contract.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> BillingResult<Option<AccountState>>;
    async fn find_by_customer_id(&self, customer_id: &str) -> BillingResult<Option<AccountState>>;
    async fn find_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<AccountState>>;

    /// Apply a handler-produced patch. Absolute, last-write-wins.
    async fn apply_patch(&self, account_id: Uuid, patch: &AccountPatch) -> BillingResult<()>;

    /// Narrow entitlement read for downstream consumers.
    async fn entitlement(&self, account_id: Uuid) -> BillingResult<Option<Entitlement>>;
}

#[derive(Debug, sqlx::FromRow)]
struct AccountRow {
    id: Uuid,
    email: String,
    stripe_customer_id: Option<String>,
    stripe_subscription_id: Option<String>,
    subscription_tier: String,
    subscription_status: String,
    access_granted: bool,
    current_period_end: Option<OffsetDateTime>,
}

impl TryFrom<AccountRow> for AccountState {
    type Error = BillingError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        let tier = row
            .subscription_tier
            .parse::<SubscriptionTier>()
            .map_err(|e| BillingError::Database(e.to_string()))?;
        let status = row
            .subscription_status
            .parse::<SubscriptionStatus>()
            .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(AccountState {
            id: row.id,
            email: row.email,
            stripe_customer_id: row.stripe_customer_id,
            stripe_subscription_id: row.stripe_subscription_id,
            tier,
            status,
            access_granted: row.access_granted,
            current_period_end: row.current_period_end,
        })
    }
}

const ACCOUNT_COLUMNS: &str = "id, email, stripe_customer_id, stripe_subscription_id, \
     subscription_tier, subscription_status, access_granted, current_period_end";

/// Postgres-backed account store.
#[derive(Clone)]
pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_by(&self, column: &str, value: &str) -> BillingResult<Option<AccountState>> {
        let query = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE {column} = $1");
        let row: Option<AccountRow> = sqlx::query_as(&query)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        row.map(AccountState::try_from).transpose()
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn find_by_email(&self, email: &str) -> BillingResult<Option<AccountState>> {
        self.fetch_by("email", email).await
    }

    async fn find_by_customer_id(&self, customer_id: &str) -> BillingResult<Option<AccountState>> {
        self.fetch_by("stripe_customer_id", customer_id).await
    }

    async fn find_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<AccountState>> {
        self.fetch_by("stripe_subscription_id", subscription_id)
            .await
    }

    async fn apply_patch(&self, account_id: Uuid, patch: &AccountPatch) -> BillingResult<()> {
        if patch.is_empty() {
            return Ok(());
        }

        let set_period = patch.current_period_end.is_some();
        let period_value = patch.current_period_end.clone().flatten();

        let result = sqlx::query(
            r#"
            UPDATE accounts SET
                stripe_customer_id = COALESCE($2, stripe_customer_id),
                stripe_subscription_id = COALESCE($3, stripe_subscription_id),
                subscription_tier = COALESCE($4, subscription_tier),
                subscription_status = COALESCE($5, subscription_status),
                access_granted = COALESCE($6, access_granted),
                current_period_end = CASE WHEN $7 THEN $8 ELSE current_period_end END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(account_id)
        .bind(patch.stripe_customer_id.as_deref())
        .bind(patch.stripe_subscription_id.as_deref())
        .bind(patch.tier.map(|t| t.as_str()))
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.access_granted)
        .bind(set_period)
        .bind(period_value)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::MissingAccount {
                lookup: format!("account id {account_id}"),
            });
        }
        Ok(())
    }

    async fn entitlement(&self, account_id: Uuid) -> BillingResult<Option<Entitlement>> {
        let row: Option<(String, bool)> = sqlx::query_as(
            "SELECT subscription_tier, access_granted FROM accounts WHERE id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(tier, access_granted)| {
            let tier = tier
                .parse::<SubscriptionTier>()
                .map_err(|e| BillingError::Database(e.to_string()))?;
            Ok(Entitlement {
                tier,
                access_granted,
            })
        })
        .transpose()
    }
}
