//! Billing error types.

/// Result alias for billing operations.
pub type BillingResult<T> = Result<T, BillingError>;

/// Errors raised by the reconciliation core.
///
/// Everything in here is caught at the engine boundary and converted into a
/// `ProcessingResult`; nothing crosses `ingest` as a panic or an unhandled
/// error.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// The price id on a subscription is not in the plan catalog. Requires
    /// operator action (extend the catalog) before a retry can succeed.
    #[error("unknown plan: no tier configured for price id '{price_id}'")]
    UnknownPlan { price_id: String },

    /// The event references a customer/subscription/email with no matching
    /// account. Usually self-resolves on retry once the account row exists.
    #[error("no account matched {lookup}")]
    MissingAccount { lookup: String },

    /// The event type string is not one this system handles. Rejected
    /// before the event store.
    #[error("unrecognized event type '{event_type}'")]
    UnknownEventType { event_type: String },

    /// The stored payload did not decode into the typed form the handler
    /// expects.
    #[error("invalid {event_type} payload: {message}")]
    Payload {
        event_type: String,
        message: String,
    },

    /// Retry was requested for an event that is not in a retriable state.
    #[error("event {event_id} is '{status}' and cannot be retried")]
    NotRetriable { event_id: String, status: String },

    #[error("event {0} not found")]
    EventNotFound(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("notification dispatch failed: {0}")]
    Notification(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl BillingError {
    /// Stable machine-readable code, stored alongside `last_error` so
    /// operators can filter the failed-event backlog.
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::UnknownPlan { .. } => "unknown_plan",
            BillingError::MissingAccount { .. } => "missing_account",
            BillingError::UnknownEventType { .. } => "unknown_event_type",
            BillingError::Payload { .. } => "invalid_payload",
            BillingError::NotRetriable { .. } => "not_retriable",
            BillingError::EventNotFound(_) => "event_not_found",
            BillingError::Database(_) => "database",
            BillingError::Notification(_) => "notification",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_plan_names_the_price_id() {
        let err = BillingError::UnknownPlan {
            price_id: "price_abc".to_string(),
        };
        assert!(err.to_string().contains("price_abc"));
        assert_eq!(err.code(), "unknown_plan");
    }
}
