//! Typed webhook event model.
//!
//! The HTTP layer hands this crate an already signature-verified,
//! deserialized event envelope. Dispatch is a closed enum rather than a
//! string match with a default branch, so supporting a new Stripe event
//! type is a compile-time decision.

use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

/// The deserialized webhook envelope as received from the transport layer.
///
/// `data` is kept opaque here and stored verbatim; the typed decode happens
/// after the dedup record exists so a malformed payload still leaves an
/// auditable, retriable event row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// The Stripe event types this system reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    CustomerCreated,
    CustomerUpdated,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    TrialWillEnd,
    InvoicePaid,
    InvoicePaymentFailed,
}

impl EventType {
    pub const ALL: [EventType; 8] = [
        EventType::CustomerCreated,
        EventType::CustomerUpdated,
        EventType::SubscriptionCreated,
        EventType::SubscriptionUpdated,
        EventType::SubscriptionDeleted,
        EventType::TrialWillEnd,
        EventType::InvoicePaid,
        EventType::InvoicePaymentFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::CustomerCreated => "customer.created",
            EventType::CustomerUpdated => "customer.updated",
            EventType::SubscriptionCreated => "customer.subscription.created",
            EventType::SubscriptionUpdated => "customer.subscription.updated",
            EventType::SubscriptionDeleted => "customer.subscription.deleted",
            EventType::TrialWillEnd => "customer.subscription.trial_will_end",
            EventType::InvoicePaid => "invoice.paid",
            EventType::InvoicePaymentFailed => "invoice.payment_failed",
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "customer.created" => Ok(EventType::CustomerCreated),
            "customer.updated" => Ok(EventType::CustomerUpdated),
            "customer.subscription.created" => Ok(EventType::SubscriptionCreated),
            "customer.subscription.updated" => Ok(EventType::SubscriptionUpdated),
            "customer.subscription.deleted" => Ok(EventType::SubscriptionDeleted),
            "customer.subscription.trial_will_end" => Ok(EventType::TrialWillEnd),
            "invoice.paid" => Ok(EventType::InvoicePaid),
            "invoice.payment_failed" => Ok(EventType::InvoicePaymentFailed),
            other => Err(BillingError::UnknownEventType {
                event_type: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `customer.*` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerPayload {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionItem {
    pub price: Price,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Price {
    pub id: String,
}

/// `customer.subscription.*` payload.
///
/// Timestamps are Unix seconds, as on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionPayload {
    pub id: String,
    pub customer: String,
    pub status: String,
    #[serde(default)]
    pub items: SubscriptionItems,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub ended_at: Option<i64>,
    #[serde(default)]
    pub trial_end: Option<i64>,
}

impl SubscriptionPayload {
    /// Price id of the first subscription item (single-plan subscriptions).
    pub fn price_id(&self) -> Option<&str> {
        self.items.data.first().map(|item| item.price.id.as_str())
    }
}

/// `invoice.*` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoicePayload {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub amount_paid: Option<i64>,
    #[serde(default)]
    pub amount_due: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub period_start: Option<i64>,
    #[serde(default)]
    pub period_end: Option<i64>,
}

/// A fully typed event, ready for handler dispatch.
#[derive(Debug, Clone)]
pub enum EventKind {
    CustomerCreated(CustomerPayload),
    CustomerUpdated(CustomerPayload),
    SubscriptionCreated(SubscriptionPayload),
    SubscriptionUpdated(SubscriptionPayload),
    SubscriptionDeleted(SubscriptionPayload),
    TrialWillEnd(SubscriptionPayload),
    InvoicePaid(InvoicePayload),
    InvoicePaymentFailed(InvoicePayload),
}

/// How the engine should locate the account an event refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountLookup<'a> {
    /// Customer lifecycle events match by email; linkage may not exist yet
    /// and that is fine.
    ByEmail(Option<&'a str>),
    /// Subscription and invoice events match by the linked customer id,
    /// falling back to the subscription id.
    ByCustomer {
        customer_id: Option<&'a str>,
        subscription_id: Option<&'a str>,
    },
}

impl EventKind {
    /// Decode the stored payload into its typed form.
    ///
    /// Accepts either the Stripe `data` envelope (`{"object": {...}}`) or a
    /// bare object, so replayed rows and direct library use both work.
    pub fn decode(event_type: EventType, data: &serde_json::Value) -> BillingResult<EventKind> {
        let object = data.get("object").unwrap_or(data);

        fn parse<T: serde::de::DeserializeOwned>(
            event_type: EventType,
            object: &serde_json::Value,
        ) -> BillingResult<T> {
            serde_json::from_value(object.clone()).map_err(|e| BillingError::Payload {
                event_type: event_type.to_string(),
                message: e.to_string(),
            })
        }

        Ok(match event_type {
            EventType::CustomerCreated => EventKind::CustomerCreated(parse(event_type, object)?),
            EventType::CustomerUpdated => EventKind::CustomerUpdated(parse(event_type, object)?),
            EventType::SubscriptionCreated => {
                EventKind::SubscriptionCreated(parse(event_type, object)?)
            }
            EventType::SubscriptionUpdated => {
                EventKind::SubscriptionUpdated(parse(event_type, object)?)
            }
            EventType::SubscriptionDeleted => {
                EventKind::SubscriptionDeleted(parse(event_type, object)?)
            }
            EventType::TrialWillEnd => EventKind::TrialWillEnd(parse(event_type, object)?),
            EventType::InvoicePaid => EventKind::InvoicePaid(parse(event_type, object)?),
            EventType::InvoicePaymentFailed => {
                EventKind::InvoicePaymentFailed(parse(event_type, object)?)
            }
        })
    }

    pub fn event_type(&self) -> EventType {
        match self {
            EventKind::CustomerCreated(_) => EventType::CustomerCreated,
            EventKind::CustomerUpdated(_) => EventType::CustomerUpdated,
            EventKind::SubscriptionCreated(_) => EventType::SubscriptionCreated,
            EventKind::SubscriptionUpdated(_) => EventType::SubscriptionUpdated,
            EventKind::SubscriptionDeleted(_) => EventType::SubscriptionDeleted,
            EventKind::TrialWillEnd(_) => EventType::TrialWillEnd,
            EventKind::InvoicePaid(_) => EventType::InvoicePaid,
            EventKind::InvoicePaymentFailed(_) => EventType::InvoicePaymentFailed,
        }
    }

    pub fn lookup(&self) -> AccountLookup<'_> {
        match self {
            EventKind::CustomerCreated(c) | EventKind::CustomerUpdated(c) => {
                AccountLookup::ByEmail(c.email.as_deref())
            }
            EventKind::SubscriptionCreated(s)
            | EventKind::SubscriptionUpdated(s)
            | EventKind::SubscriptionDeleted(s)
            | EventKind::TrialWillEnd(s) => AccountLookup::ByCustomer {
                customer_id: Some(s.customer.as_str()),
                subscription_id: Some(s.id.as_str()),
            },
            EventKind::InvoicePaid(i) | EventKind::InvoicePaymentFailed(i) => {
                AccountLookup::ByCustomer {
                    customer_id: i.customer.as_deref(),
                    subscription_id: i.subscription.as_deref(),
                }
            }
        }
    }
}
