//! Best-effort notification dispatch.
//!
//! Handlers emit declarative `NotificationRequest`s; the engine hands them
//! to a `NotificationSink` only after the reconciled state is durably
//! committed. A sink failure is logged and never reaches the event record.

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use draftly_shared::SubscriptionTier;

use crate::error::{BillingError, BillingResult};

/// A side-effect request produced by an event handler.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum NotificationRequest {
    /// First subscription for this account: send the welcome email.
    Welcome {
        account_id: Uuid,
        email: String,
        tier: SubscriptionTier,
    },
    /// Stripe fires trial_will_end three days before the trial converts.
    TrialEnding {
        account_id: Uuid,
        email: String,
        trial_end: Option<OffsetDateTime>,
    },
    /// A renewal payment failed; the account entered the grace window.
    PaymentFailed {
        account_id: Uuid,
        email: String,
        amount_cents: i64,
    },
    /// A previously failed event was retried successfully.
    Recovered {
        stripe_event_id: String,
        event_type: String,
        attempts: i32,
    },
}

impl NotificationRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            NotificationRequest::Welcome { .. } => "welcome",
            NotificationRequest::TrialEnding { .. } => "trial-ending",
            NotificationRequest::PaymentFailed { .. } => "payment-failed",
            NotificationRequest::Recovered { .. } => "recovered",
        }
    }
}

/// Notification delivery contract. Implementations may retry internally;
/// callers treat any error as final and only log it.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, request: &NotificationRequest) -> BillingResult<()>;
}

/// Resend-backed email sink.
///
/// Cleanly disabled when `RESEND_API_KEY` is unset so development and
/// self-hosted deployments work without an email provider.
#[derive(Clone)]
pub struct EmailNotifier {
    client: reqwest::Client,
    api_key: String,
    from_address: String,
    ops_address: Option<String>,
    api_base: String,
}

impl EmailNotifier {
    pub fn from_env() -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: std::env::var("RESEND_API_KEY").unwrap_or_default(),
            from_address: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Draftly <billing@draftly.app>".to_string()),
            ops_address: std::env::var("OPS_ALERT_EMAIL").ok().filter(|s| !s.is_empty()),
            api_base: "https://api.resend.com".to_string(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn render(&self, request: &NotificationRequest) -> Option<(String, String, String)> {
        match request {
            NotificationRequest::Welcome { email, tier, .. } => Some((
                email.clone(),
                format!("Welcome to Draftly {}", capitalize(tier.as_str())),
                format!(
                    "Your {} subscription is active. Every generation you run from \
                     now on counts against your new daily allowance.",
                    tier.as_str()
                ),
            )),
            NotificationRequest::TrialEnding { email, trial_end, .. } => {
                let when = trial_end
                    .map(|t| t.date().to_string())
                    .unwrap_or_else(|| "soon".to_string());
                Some((
                    email.clone(),
                    "Your Draftly trial is ending".to_string(),
                    format!(
                        "Your trial converts to a paid subscription on {when}. \
                         Update your billing details if anything has changed."
                    ),
                ))
            }
            NotificationRequest::PaymentFailed {
                email,
                amount_cents,
                ..
            } => Some((
                email.clone(),
                "Payment failed for your Draftly subscription".to_string(),
                format!(
                    "We couldn't collect ${:.2}. Your access continues while we \
                     retry; please update your payment method.",
                    *amount_cents as f64 / 100.0
                ),
            )),
            NotificationRequest::Recovered {
                stripe_event_id,
                event_type,
                attempts,
            } => self.ops_address.as_ref().map(|ops| {
                (
                    ops.clone(),
                    format!("Billing event recovered: {stripe_event_id}"),
                    format!(
                        "Event {stripe_event_id} ({event_type}) processed successfully \
                         after {attempts} failed attempt(s)."
                    ),
                )
            }),
        }
    }

    async fn post_email(&self, to: &str, subject: &str, body: &str) -> BillingResult<()> {
        let response = self
            .client
            .post(format!("{}/emails", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "from": self.from_address,
                "to": [to],
                "subject": subject,
                "text": body,
            }))
            .send()
            .await
            .map_err(|e| BillingError::Notification(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(BillingError::Notification(format!(
                "email API returned {status}: {detail}"
            )));
        }
        Ok(())
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[async_trait]
impl NotificationSink for EmailNotifier {
    async fn send(&self, request: &NotificationRequest) -> BillingResult<()> {
        if !self.is_enabled() {
            tracing::debug!(
                kind = request.kind(),
                "Email notifications disabled, skipping"
            );
            return Ok(());
        }

        let Some((to, subject, body)) = self.render(request) else {
            tracing::debug!(
                kind = request.kind(),
                "No recipient configured for notification, skipping"
            );
            return Ok(());
        };

        let strategy = ExponentialBackoff::from_millis(200).map(jitter).take(3);
        Retry::spawn(strategy, || self.post_email(&to, &subject, &body)).await?;

        tracing::info!(kind = request.kind(), to = %to, "Notification sent");
        Ok(())
    }
}
