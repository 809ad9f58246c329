//! Billing endpoints
//!
//! Authentication is handled upstream of this service; handlers take the
//! user ID explicitly from the request.

use axum::extract::{Path, Query, State};
use axum::Json;
use parley_billing::{CheckoutResponse, CheckoutSyncResult, InvoiceRecord, SubscriptionRecord};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateCheckoutRequest {
    pub user_id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub price_id: String,
}

/// Start a subscription checkout for a user.
pub async fn create_checkout(
    State(state): State<AppState>,
    Json(req): Json<CreateCheckoutRequest>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    let response = state
        .billing
        .checkout
        .create_session(req.user_id, &req.email, req.name.as_deref(), &req.price_id)
        .await?;

    Ok(Json(response))
}

/// Reconcile a checkout session from the client's return flow. Idempotent,
/// works whether or not the webhooks for the session arrived.
pub async fn sync_checkout(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<CheckoutSyncResult>, ApiError> {
    let result = state
        .billing
        .checkout
        .sync_completed_session(&session_id)
        .await?;

    Ok(Json(result))
}

#[derive(Debug, Serialize)]
pub struct PlanResponse {
    pub price_id: String,
    pub nickname: Option<String>,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    pub interval: Option<String>,
}

/// Active prices for the configured product.
pub async fn list_prices(
    State(state): State<AppState>,
) -> Result<Json<Vec<PlanResponse>>, ApiError> {
    let prices = state.billing.stripe.list_prices_for_product().await?;

    let plans = prices
        .into_iter()
        .map(|price| PlanResponse {
            price_id: price.id.to_string(),
            nickname: price.nickname.clone(),
            amount_cents: price.unit_amount,
            currency: price.currency.map(|c| c.to_string()),
            interval: price.recurring.as_ref().map(|r| r.interval.to_string()),
        })
        .collect();

    Ok(Json(plans))
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user_id: Uuid,
}

/// Current subscription for a user.
pub async fn get_subscription(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<SubscriptionRecord>, ApiError> {
    let record = state
        .billing
        .subscriptions
        .get_for_user(query.user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no subscription for user {}", query.user_id)))?;

    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
pub struct CancelQuery {
    pub user_id: Uuid,
    /// Defaults to cancellation at period end.
    #[serde(default)]
    pub immediately: bool,
}

/// Cancel a user's subscription.
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Query(query): Query<CancelQuery>,
) -> Result<Json<SubscriptionRecord>, ApiError> {
    let current = state
        .billing
        .subscriptions
        .get_for_user(query.user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no subscription for user {}", query.user_id)))?;

    let record = state
        .billing
        .subscriptions
        .cancel(&current.stripe_subscription_id, query.immediately)
        .await?;

    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
pub struct InvoiceListQuery {
    pub user_id: Uuid,
    #[serde(default = "default_invoice_limit")]
    pub limit: i64,
}

fn default_invoice_limit() -> i64 {
    24
}

/// Billing history for a user, newest first.
pub async fn list_invoices(
    State(state): State<AppState>,
    Query(query): Query<InvoiceListQuery>,
) -> Result<Json<Vec<InvoiceRecord>>, ApiError> {
    let limit = query.limit.clamp(1, 100);
    let invoices = state
        .billing
        .invoices
        .list_for_user(query.user_id, limit)
        .await?;

    Ok(Json(invoices))
}
