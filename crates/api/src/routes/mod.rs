//! HTTP routes

pub mod billing;
pub mod webhooks;

use axum::routing::{get, post};
use axum::{Json, Router};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .route("/billing/checkout", post(billing::create_checkout))
        .route(
            "/billing/checkout/{session_id}/sync",
            post(billing::sync_checkout),
        )
        .route("/billing/prices", get(billing::list_prices))
        .route(
            "/billing/subscription",
            get(billing::get_subscription).delete(billing::cancel_subscription),
        )
        .route("/billing/invoices", get(billing::list_invoices))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
