//! API error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use parley_billing::BillingError;

/// Errors surfaced to HTTP clients.
///
/// The webhook endpoint leans on the split From<BillingError> makes here:
/// verification failures become 4xx (Stripe will not retry), while
/// processing failures become 5xx so Stripe redelivers the event.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("internal server error")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        if err.is_client_error() {
            return ApiError::BadRequest(err.to_string());
        }
        match err {
            BillingError::NotFound(what) => ApiError::NotFound(what),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Internal details go to the log, not the client.
        let message = match &self {
            ApiError::Internal(detail) => {
                tracing::error!(detail = %detail, "Internal server error");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_failures_map_to_400() {
        let err: ApiError = BillingError::InvalidSignature.into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err: ApiError = BillingError::MalformedPayload("not json".into()).into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn processing_failures_map_to_500() {
        let err: ApiError = BillingError::DanglingReference {
            entity: "subscription",
            reference: "cus_missing".into(),
        }
        .into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let err: ApiError = BillingError::Internal("boom".into()).into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn missing_records_map_to_404() {
        let err: ApiError = BillingError::NotFound("subscription sub_1".into()).into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
