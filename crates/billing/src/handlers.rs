//! Pure event handlers.
//!
//! Each handler is a function from (typed payload, current account state)
//! to a declarative `Outcome`: the absolute next state, an optional history
//! entry, and any notification requests. No handler performs I/O; the
//! engine owns every lookup, write, and dispatch. Handlers compute absolute
//! next-state from the payload rather than incremental deltas, which is
//! what makes out-of-order and duplicate delivery safe.

use time::OffsetDateTime;
use uuid::Uuid;

use draftly_shared::{SubscriptionStatus, SubscriptionTier};

use crate::accounts::{AccountPatch, AccountState};
use crate::error::{BillingError, BillingResult};
use crate::events::{CustomerPayload, EventKind, InvoicePayload, SubscriptionPayload};
use crate::history::HistoryDraft;
use crate::notify::NotificationRequest;
use crate::plans::PlanCatalog;

/// Declarative result of handling one event.
#[derive(Debug, Default)]
pub struct Outcome {
    pub account_id: Option<Uuid>,
    pub patch: Option<AccountPatch>,
    pub history: Option<HistoryDraft>,
    pub notifications: Vec<NotificationRequest>,
    /// Set when the event was processed without touching anything.
    pub noop: Option<&'static str>,
}

impl Outcome {
    fn noop(reason: &'static str) -> Self {
        Outcome {
            noop: Some(reason),
            ..Default::default()
        }
    }
}

/// Dispatch an event to its handler.
///
/// `account` is the result of the engine's lookup for this event; `now` is
/// injected so handlers stay deterministic.
pub fn apply_event(
    kind: &EventKind,
    account: Option<&AccountState>,
    catalog: &PlanCatalog,
    now: OffsetDateTime,
) -> BillingResult<Outcome> {
    match kind {
        EventKind::CustomerCreated(c) | EventKind::CustomerUpdated(c) => {
            Ok(handle_customer(c, account))
        }
        EventKind::SubscriptionCreated(s) => {
            handle_subscription_upsert(s, require_account(account, s)?, catalog, true)
        }
        EventKind::SubscriptionUpdated(s) => {
            handle_subscription_upsert(s, require_account(account, s)?, catalog, false)
        }
        EventKind::SubscriptionDeleted(s) => {
            Ok(handle_subscription_deleted(s, require_account(account, s)?, now))
        }
        EventKind::TrialWillEnd(s) => Ok(handle_trial_will_end(s, require_account(account, s)?)),
        EventKind::InvoicePaid(i) => Ok(handle_invoice_paid(i, require_invoice_account(account, i)?)),
        EventKind::InvoicePaymentFailed(i) => Ok(handle_invoice_payment_failed(
            i,
            require_invoice_account(account, i)?,
        )),
    }
}

fn require_account<'a>(
    account: Option<&'a AccountState>,
    payload: &SubscriptionPayload,
) -> BillingResult<&'a AccountState> {
    account.ok_or_else(|| BillingError::MissingAccount {
        lookup: format!(
            "customer '{}' / subscription '{}'",
            payload.customer, payload.id
        ),
    })
}

fn require_invoice_account<'a>(
    account: Option<&'a AccountState>,
    payload: &InvoicePayload,
) -> BillingResult<&'a AccountState> {
    account.ok_or_else(|| BillingError::MissingAccount {
        lookup: format!(
            "customer '{}' / subscription '{}' (invoice '{}')",
            payload.customer.as_deref().unwrap_or("?"),
            payload.subscription.as_deref().unwrap_or("?"),
            payload.id
        ),
    })
}

fn parse_status(payload: &SubscriptionPayload) -> BillingResult<SubscriptionStatus> {
    payload
        .status
        .parse::<SubscriptionStatus>()
        .map_err(|e| BillingError::Payload {
            event_type: "customer.subscription.*".to_string(),
            message: e.to_string(),
        })
}

fn ts(unix: Option<i64>) -> Option<OffsetDateTime> {
    unix.and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok())
}

/// Entitlement that follows from a provider status.
///
/// `past_due` keeps whatever the account already had (the grace window);
/// terminal statuses drop to free.
fn entitlement_after(
    status: SubscriptionStatus,
    plan_tier: SubscriptionTier,
    account: &AccountState,
) -> (SubscriptionTier, bool) {
    match status {
        SubscriptionStatus::Active | SubscriptionStatus::Trialing => (plan_tier, true),
        SubscriptionStatus::PastDue => (account.tier, account.access_granted),
        SubscriptionStatus::Canceled | SubscriptionStatus::Incomplete => {
            (SubscriptionTier::Free, false)
        }
    }
}

/// `customer.created` / `customer.updated`: link the Stripe customer id to
/// the account matching the customer email. A missing account is a no-op,
/// not a failure: the linkage can arrive later via the subscription events.
fn handle_customer(payload: &CustomerPayload, account: Option<&AccountState>) -> Outcome {
    let Some(account) = account else {
        return Outcome::noop("no account matched customer email");
    };

    if account.stripe_customer_id.as_deref() == Some(payload.id.as_str()) {
        return Outcome::noop("customer already linked");
    }

    Outcome {
        account_id: Some(account.id),
        patch: Some(AccountPatch {
            stripe_customer_id: Some(payload.id.clone()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// `customer.subscription.created` / `customer.subscription.updated`.
///
/// Both compute the same absolute state; only `created` may emit the
/// welcome notification, and only for a subscription id the account has
/// not carried before.
fn handle_subscription_upsert(
    payload: &SubscriptionPayload,
    account: &AccountState,
    catalog: &PlanCatalog,
    is_created: bool,
) -> BillingResult<Outcome> {
    let status = parse_status(payload)?;
    let price_id = payload
        .price_id()
        .ok_or_else(|| BillingError::Payload {
            event_type: "customer.subscription.*".to_string(),
            message: format!("subscription '{}' has no price item", payload.id),
        })?;
    let plan = catalog.resolve(price_id)?;

    let (tier, access_granted) = entitlement_after(status, plan.tier, account);
    let period_end = ts(payload.current_period_end);

    let patch = AccountPatch {
        stripe_customer_id: Some(payload.customer.clone()),
        stripe_subscription_id: Some(payload.id.clone()),
        tier: Some(tier),
        status: Some(status),
        access_granted: Some(access_granted),
        current_period_end: Some(period_end),
    };

    let history = HistoryDraft {
        account_id: account.id,
        stripe_subscription_id: Some(payload.id.clone()),
        status,
        plan_name: tier.as_str().to_string(),
        amount_cents: plan.amount_cents,
        currency: plan.currency.to_string(),
        billing_interval: Some(plan.billing_interval.to_string()),
        period_start: ts(payload.current_period_start),
        period_end,
        canceled_at: ts(payload.canceled_at),
        ended_at: ts(payload.ended_at),
    };

    let mut notifications = Vec::new();
    let first_time_subscription =
        account.stripe_subscription_id.as_deref() != Some(payload.id.as_str());
    if is_created && first_time_subscription {
        notifications.push(NotificationRequest::Welcome {
            account_id: account.id,
            email: account.email.clone(),
            tier: plan.tier,
        });
    }

    Ok(Outcome {
        account_id: Some(account.id),
        patch: Some(patch),
        history: Some(history),
        notifications,
        noop: None,
    })
}

/// `customer.subscription.deleted`.
///
/// A cancellation before the paid period ends keeps tier and access; the
/// scheduled sweep revokes them once the period elapses. A cancellation
/// after the period end downgrades immediately.
fn handle_subscription_deleted(
    payload: &SubscriptionPayload,
    account: &AccountState,
    now: OffsetDateTime,
) -> Outcome {
    let canceled_at = ts(payload.canceled_at).unwrap_or(now);
    let ended_at = ts(payload.ended_at);
    let period_end = ts(payload.current_period_end).or(account.current_period_end);
    let in_grace = period_end.map(|pe| canceled_at < pe).unwrap_or(false);

    let (tier, access_granted) = if in_grace {
        (account.tier, account.access_granted)
    } else {
        (SubscriptionTier::Free, false)
    };

    let patch = AccountPatch {
        tier: Some(tier),
        status: Some(SubscriptionStatus::Canceled),
        access_granted: Some(access_granted),
        current_period_end: Some(period_end),
        ..Default::default()
    };

    let history = HistoryDraft {
        account_id: account.id,
        stripe_subscription_id: Some(payload.id.clone()),
        status: SubscriptionStatus::Canceled,
        plan_name: tier.as_str().to_string(),
        amount_cents: 0,
        currency: "usd".to_string(),
        billing_interval: None,
        period_start: ts(payload.current_period_start),
        period_end,
        canceled_at: Some(canceled_at),
        ended_at,
    };

    Outcome {
        account_id: Some(account.id),
        patch: Some(patch),
        history: Some(history),
        notifications: Vec::new(),
        noop: None,
    }
}

/// `invoice.paid`: audit-only, except that a paid invoice clears the
/// `past_due` grace state back to `active`.
fn handle_invoice_paid(payload: &InvoicePayload, account: &AccountState) -> Outcome {
    let was_past_due = account.status == SubscriptionStatus::PastDue;
    let status_after = if was_past_due {
        SubscriptionStatus::Active
    } else {
        account.status
    };

    let patch = if was_past_due {
        Some(AccountPatch {
            status: Some(SubscriptionStatus::Active),
            access_granted: Some(true),
            ..Default::default()
        })
    } else {
        None
    };

    let history = HistoryDraft {
        account_id: account.id,
        stripe_subscription_id: payload
            .subscription
            .clone()
            .or_else(|| account.stripe_subscription_id.clone()),
        status: status_after,
        plan_name: account.tier.as_str().to_string(),
        amount_cents: payload.amount_paid.unwrap_or(0),
        currency: payload.currency.clone().unwrap_or_else(|| "usd".to_string()),
        billing_interval: None,
        period_start: ts(payload.period_start),
        period_end: ts(payload.period_end),
        canceled_at: None,
        ended_at: None,
    };

    Outcome {
        account_id: Some(account.id),
        patch,
        history: Some(history),
        notifications: Vec::new(),
        noop: None,
    }
}

/// `invoice.payment_failed`: enter the `past_due` grace window. Access is
/// deliberately left untouched; the account is not cut off on a first
/// failed renewal.
fn handle_invoice_payment_failed(payload: &InvoicePayload, account: &AccountState) -> Outcome {
    let patch = AccountPatch {
        status: Some(SubscriptionStatus::PastDue),
        ..Default::default()
    };

    let history = HistoryDraft {
        account_id: account.id,
        stripe_subscription_id: payload
            .subscription
            .clone()
            .or_else(|| account.stripe_subscription_id.clone()),
        status: SubscriptionStatus::PastDue,
        plan_name: account.tier.as_str().to_string(),
        amount_cents: payload.amount_due.unwrap_or(0),
        currency: payload.currency.clone().unwrap_or_else(|| "usd".to_string()),
        billing_interval: None,
        period_start: ts(payload.period_start),
        period_end: ts(payload.period_end),
        canceled_at: None,
        ended_at: None,
    };

    Outcome {
        account_id: Some(account.id),
        patch: Some(patch),
        history: Some(history),
        notifications: vec![NotificationRequest::PaymentFailed {
            account_id: account.id,
            email: account.email.clone(),
            amount_cents: payload.amount_due.unwrap_or(0),
        }],
        noop: None,
    }
}

/// `customer.subscription.trial_will_end`: notification only.
fn handle_trial_will_end(payload: &SubscriptionPayload, account: &AccountState) -> Outcome {
    Outcome {
        account_id: Some(account.id),
        patch: None,
        history: None,
        notifications: vec![NotificationRequest::TrialEnding {
            account_id: account.id,
            email: account.email.clone(),
            trial_end: ts(payload.trial_end),
        }],
        noop: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Price, SubscriptionItem, SubscriptionItems};

    const NOW_UNIX: i64 = 1_700_000_000;
    const MONTH: i64 = 30 * 86_400;

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(NOW_UNIX).unwrap()
    }

    fn free_account() -> AccountState {
        AccountState {
            id: Uuid::new_v4(),
            email: "writer@example.com".to_string(),
            stripe_customer_id: None,
            stripe_subscription_id: None,
            tier: SubscriptionTier::Free,
            status: SubscriptionStatus::Incomplete,
            access_granted: false,
            current_period_end: None,
        }
    }

    fn starter_account() -> AccountState {
        AccountState {
            stripe_customer_id: Some("cus_1".to_string()),
            stripe_subscription_id: Some("sub_1".to_string()),
            tier: SubscriptionTier::Starter,
            status: SubscriptionStatus::Active,
            access_granted: true,
            current_period_end: OffsetDateTime::from_unix_timestamp(NOW_UNIX + MONTH).ok(),
            ..free_account()
        }
    }

    fn subscription_payload(status: &str, price_id: &str) -> SubscriptionPayload {
        SubscriptionPayload {
            id: "sub_1".to_string(),
            customer: "cus_1".to_string(),
            status: status.to_string(),
            items: SubscriptionItems {
                data: vec![SubscriptionItem {
                    price: Price {
                        id: price_id.to_string(),
                    },
                }],
            },
            current_period_start: Some(NOW_UNIX),
            current_period_end: Some(NOW_UNIX + MONTH),
            canceled_at: None,
            ended_at: None,
            trial_end: None,
        }
    }

    fn catalog() -> PlanCatalog {
        PlanCatalog::builtin()
    }

    #[test]
    fn customer_created_without_account_is_a_noop() {
        let payload = CustomerPayload {
            id: "cus_9".to_string(),
            email: Some("nobody@example.com".to_string()),
            name: None,
        };
        let outcome = handle_customer(&payload, None);
        assert!(outcome.noop.is_some());
        assert!(outcome.patch.is_none());
        assert!(outcome.history.is_none());
    }

    #[test]
    fn customer_created_links_the_customer_id() {
        let account = free_account();
        let payload = CustomerPayload {
            id: "cus_42".to_string(),
            email: Some(account.email.clone()),
            name: None,
        };
        let outcome = handle_customer(&payload, Some(&account));
        let patch = outcome.patch.unwrap();
        assert_eq!(patch.stripe_customer_id.as_deref(), Some("cus_42"));
        assert!(patch.tier.is_none(), "linkage must not touch the tier");
    }

    #[test]
    fn subscription_created_resolves_starter_and_grants_access() {
        let account = free_account();
        let kind = EventKind::SubscriptionCreated(subscription_payload("active", "price_starter"));
        let outcome = apply_event(&kind, Some(&account), &catalog(), now()).unwrap();

        let patch = outcome.patch.unwrap();
        assert_eq!(patch.tier, Some(SubscriptionTier::Starter));
        assert_eq!(patch.status, Some(SubscriptionStatus::Active));
        assert_eq!(patch.access_granted, Some(true));

        let history = outcome.history.unwrap();
        assert_eq!(history.plan_name, "starter");
        assert_eq!(history.amount_cents, 4700);

        assert_eq!(outcome.notifications.len(), 1);
        assert_eq!(outcome.notifications[0].kind(), "welcome");
    }

    #[test]
    fn subscription_created_with_unknown_price_fails() {
        let account = free_account();
        let kind = EventKind::SubscriptionCreated(subscription_payload("active", "price_unknown"));
        let err = apply_event(&kind, Some(&account), &catalog(), now()).unwrap_err();
        assert_eq!(err.code(), "unknown_plan");
    }

    #[test]
    fn subscription_created_without_account_is_missing_account() {
        let kind = EventKind::SubscriptionCreated(subscription_payload("active", "price_starter"));
        let err = apply_event(&kind, None, &catalog(), now()).unwrap_err();
        assert_eq!(err.code(), "missing_account");
    }

    #[test]
    fn welcome_is_skipped_when_subscription_already_linked() {
        let account = starter_account();
        let kind = EventKind::SubscriptionCreated(subscription_payload("active", "price_starter"));
        let outcome = apply_event(&kind, Some(&account), &catalog(), now()).unwrap();
        assert!(
            outcome.notifications.is_empty(),
            "welcome must fire once per subscription id"
        );
    }

    #[test]
    fn subscription_updated_reresolves_tier_without_welcome() {
        let account = starter_account();
        let kind = EventKind::SubscriptionUpdated(subscription_payload("active", "price_pro"));
        let outcome = apply_event(&kind, Some(&account), &catalog(), now()).unwrap();

        let patch = outcome.patch.unwrap();
        assert_eq!(patch.tier, Some(SubscriptionTier::Pro));
        assert!(outcome.notifications.is_empty());
    }

    #[test]
    fn trialing_subscription_grants_access() {
        let account = free_account();
        let kind = EventKind::SubscriptionCreated(subscription_payload("trialing", "price_pro"));
        let outcome = apply_event(&kind, Some(&account), &catalog(), now()).unwrap();
        let patch = outcome.patch.unwrap();
        assert_eq!(patch.access_granted, Some(true));
        assert_eq!(patch.tier, Some(SubscriptionTier::Pro));
    }

    #[test]
    fn incomplete_subscription_stays_free_without_access() {
        let account = free_account();
        let kind = EventKind::SubscriptionCreated(subscription_payload("incomplete", "price_pro"));
        let outcome = apply_event(&kind, Some(&account), &catalog(), now()).unwrap();
        let patch = outcome.patch.unwrap();
        assert_eq!(patch.access_granted, Some(false));
        assert_eq!(patch.tier, Some(SubscriptionTier::Free));
    }

    #[test]
    fn deletion_before_period_end_keeps_access() {
        let account = starter_account();
        let mut payload = subscription_payload("canceled", "price_starter");
        payload.canceled_at = Some(NOW_UNIX);
        payload.current_period_end = Some(NOW_UNIX + MONTH);

        let outcome = handle_subscription_deleted(&payload, &account, now());
        let patch = outcome.patch.unwrap();
        assert_eq!(patch.tier, Some(SubscriptionTier::Starter));
        assert_eq!(patch.access_granted, Some(true));
        assert_eq!(patch.status, Some(SubscriptionStatus::Canceled));

        let history = outcome.history.unwrap();
        assert_eq!(history.plan_name, "starter");
        assert!(history.canceled_at.is_some());
    }

    #[test]
    fn deletion_after_period_end_downgrades_immediately() {
        let account = starter_account();
        let mut payload = subscription_payload("canceled", "price_starter");
        payload.canceled_at = Some(NOW_UNIX);
        payload.current_period_end = Some(NOW_UNIX - 86_400);

        let outcome = handle_subscription_deleted(&payload, &account, now());
        let patch = outcome.patch.unwrap();
        assert_eq!(patch.tier, Some(SubscriptionTier::Free));
        assert_eq!(patch.access_granted, Some(false));

        let history = outcome.history.unwrap();
        assert_eq!(history.plan_name, "free");
    }

    #[test]
    fn invoice_paid_is_audit_only_for_active_accounts() {
        let account = starter_account();
        let payload = InvoicePayload {
            id: "in_1".to_string(),
            customer: Some("cus_1".to_string()),
            subscription: Some("sub_1".to_string()),
            amount_paid: Some(4700),
            amount_due: None,
            currency: Some("usd".to_string()),
            period_start: Some(NOW_UNIX),
            period_end: Some(NOW_UNIX + MONTH),
        };
        let outcome = handle_invoice_paid(&payload, &account);
        assert!(outcome.patch.is_none(), "no state change for active accounts");

        let history = outcome.history.unwrap();
        assert_eq!(history.amount_cents, 4700);
        assert_eq!(history.status, SubscriptionStatus::Active);
    }

    #[test]
    fn invoice_paid_clears_past_due() {
        let mut account = starter_account();
        account.status = SubscriptionStatus::PastDue;

        let payload = InvoicePayload {
            id: "in_2".to_string(),
            customer: Some("cus_1".to_string()),
            subscription: Some("sub_1".to_string()),
            amount_paid: Some(4700),
            amount_due: None,
            currency: None,
            period_start: None,
            period_end: None,
        };
        let outcome = handle_invoice_paid(&payload, &account);
        let patch = outcome.patch.unwrap();
        assert_eq!(patch.status, Some(SubscriptionStatus::Active));
        assert_eq!(patch.access_granted, Some(true));
    }

    #[test]
    fn payment_failure_enters_grace_without_revoking_access() {
        let account = starter_account();
        let payload = InvoicePayload {
            id: "in_3".to_string(),
            customer: Some("cus_1".to_string()),
            subscription: Some("sub_1".to_string()),
            amount_paid: None,
            amount_due: Some(4700),
            currency: None,
            period_start: None,
            period_end: None,
        };
        let outcome = handle_invoice_payment_failed(&payload, &account);

        let patch = outcome.patch.unwrap();
        assert_eq!(patch.status, Some(SubscriptionStatus::PastDue));
        assert!(
            patch.access_granted.is_none(),
            "access flag must stay untouched in the grace window"
        );
        assert!(patch.tier.is_none(), "tier retained during grace");

        assert_eq!(outcome.notifications.len(), 1);
        assert_eq!(outcome.notifications[0].kind(), "payment-failed");
    }

    #[test]
    fn trial_will_end_emits_only_a_notification() {
        let account = starter_account();
        let mut payload = subscription_payload("trialing", "price_starter");
        payload.trial_end = Some(NOW_UNIX + 3 * 86_400);

        let outcome = handle_trial_will_end(&payload, &account);
        assert!(outcome.patch.is_none());
        assert!(outcome.history.is_none());
        assert_eq!(outcome.notifications.len(), 1);
        assert_eq!(outcome.notifications[0].kind(), "trial-ending");
    }

    #[test]
    fn past_due_update_retains_prior_entitlement() {
        let account = starter_account();
        let kind = EventKind::SubscriptionUpdated(subscription_payload("past_due", "price_starter"));
        let outcome = apply_event(&kind, Some(&account), &catalog(), now()).unwrap();
        let patch = outcome.patch.unwrap();
        assert_eq!(patch.tier, Some(SubscriptionTier::Starter));
        assert_eq!(patch.access_granted, Some(true));
        assert_eq!(patch.status, Some(SubscriptionStatus::PastDue));
    }
}
