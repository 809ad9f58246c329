//! Billing error types

/// Errors produced by the billing subsystem.
///
/// The webhook pipeline divides these into two families: terminal request
/// errors (`InvalidSignature`, `MalformedPayload`) that respond 4xx and are
/// never retried on our side, and processing failures that leave the event
/// unprocessed so the provider's redelivery mechanism retries it.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("webhook signature verification failed")]
    InvalidSignature,

    #[error("webhook payload is not a valid event envelope: {0}")]
    MalformedPayload(String),

    /// A synchronizer needed a parent row that has not arrived yet,
    /// usually from out-of-order webhook delivery. Retryable.
    #[error("dangling reference: {entity} refers to missing {reference}")]
    DanglingReference {
        entity: &'static str,
        reference: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stripe api error: {0}")]
    StripeApi(#[from] stripe::StripeError),

    #[error("internal billing error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Terminal request errors: reject with a client error, do not touch
    /// state, and expect no benefit from a retry.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            BillingError::InvalidSignature | BillingError::MalformedPayload(_)
        )
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_and_payload_errors_are_client_errors() {
        assert!(BillingError::InvalidSignature.is_client_error());
        assert!(BillingError::MalformedPayload("bad json".into()).is_client_error());
    }

    #[test]
    fn processing_failures_are_not_client_errors() {
        let dangling = BillingError::DanglingReference {
            entity: "subscription",
            reference: "cus_123".into(),
        };
        assert!(!dangling.is_client_error());
        assert!(!BillingError::Internal("boom".into()).is_client_error());
        assert!(!BillingError::NotFound("evt_1".into()).is_client_error());
    }
}
