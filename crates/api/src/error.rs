//! API error type and response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Errors surfaced by route handlers.
///
/// Recognized-but-failed webhook events never pass through here: the
/// engine converts those into a 200 response with `success: false`, so
/// the provider does not retry a permanent failure forever. Only
/// transport/parse-class problems before the event store become non-2xx.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    /// The event type is not one this system subscribes to.
    #[error("unrecognized event type '{0}'")]
    UnrecognizedEventType(String),

    #[error("{0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<draftly_billing::BillingError> for ApiError {
    fn from(e: draftly_billing::BillingError) -> Self {
        use draftly_billing::BillingError;
        match e {
            BillingError::EventNotFound(id) => ApiError::NotFound(format!("event {id} not found")),
            BillingError::UnknownEventType { event_type } => {
                ApiError::UnrecognizedEventType(event_type)
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::UnrecognizedEventType(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Request failed");
        }

        let body = Json(serde_json::json!({
            "error": self.to_string(),
        }));
        (status, body).into_response()
    }
}
