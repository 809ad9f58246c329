//! Stripe webhook endpoint

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;

use crate::error::ApiError;
use crate::state::AppState;

/// Acknowledgment body echoed back to Stripe.
#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub event: EventSummary,
}

#[derive(Debug, Serialize)]
pub struct EventSummary {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub processed: bool,
}

/// Handle a Stripe webhook delivery.
///
/// The body must be the raw bytes Stripe sent; any reformatting would break
/// the signature. A 2xx here tells Stripe the delivery is settled, so this
/// only answers 2xx after the event is durably recorded and either processed
/// or recognized as a duplicate. Processing failures answer 5xx, leaving the
/// delivery unsettled so Stripe retries it.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookAck>, ApiError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature header".to_string())
        })?;

    let event = state.billing.webhooks.verify_event(&body, signature)?;

    tracing::info!(
        event_id = %event.id,
        event_type = %event.type_,
        "Stripe webhook event verified"
    );

    let outcome = state.billing.webhooks.handle_event(&body, event).await?;

    Ok(Json(WebhookAck {
        received: true,
        event: EventSummary {
            id: outcome.event_id,
            event_type: outcome.event_type,
            processed: outcome.processed,
        },
    }))
}
