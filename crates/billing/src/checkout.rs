//! Checkout sessions
//!
//! Creates subscription checkouts and tracks them locally. The provider is
//! expected to follow a completed checkout with a subscription-created event,
//! but delivery order is not guaranteed and the event can be lost, so the
//! local row also feeds a pull-based fallback: `sync_completed_session` is
//! called from the client's return flow and from the worker's sweep, and
//! fetches the authoritative state instead of waiting for the webhook.

use std::collections::HashMap;

use sqlx::{PgConnection, PgPool};
use stripe::{
    CheckoutSession, CheckoutSessionMode, CheckoutSessionStatus, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, CustomerId, Expandable,
};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::customers::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::subscriptions::SubscriptionService;

/// Response from creating a checkout session.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: Option<String>,
}

/// Outcome of a pull-based checkout sync.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CheckoutSyncResult {
    /// pending | completed | expired
    pub status: String,
    pub stripe_subscription_id: Option<String>,
}

/// Mark a tracked checkout session completed. Returns whether a row existed.
pub(crate) async fn mark_session_completed(
    conn: &mut PgConnection,
    stripe_session_id: &str,
    stripe_subscription_id: Option<&str>,
) -> BillingResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE checkout_sessions
        SET status = 'completed', stripe_subscription_id = $2, completed_at = NOW()
        WHERE stripe_session_id = $1
        "#,
    )
    .bind(stripe_session_id)
    .bind(stripe_subscription_id)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Checkout operations.
#[derive(Clone)]
pub struct CheckoutService {
    stripe: StripeClient,
    pool: PgPool,
    customers: CustomerService,
    subscriptions: SubscriptionService,
}

impl CheckoutService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let customers = CustomerService::new(stripe.clone(), pool.clone());
        let subscriptions = SubscriptionService::new(stripe.clone(), pool.clone());
        Self {
            stripe,
            pool,
            customers,
            subscriptions,
        }
    }

    /// Create a subscription-mode checkout session for a user and record it
    /// locally as pending. The Stripe customer is created lazily here on
    /// first checkout.
    pub async fn create_session(
        &self,
        user_id: Uuid,
        email: &str,
        name: Option<&str>,
        price_id: &str,
    ) -> BillingResult<CheckoutResponse> {
        let customer_id = self.customers.get_or_create(user_id, email, name).await?;
        let parsed_customer: CustomerId = customer_id
            .parse()
            .map_err(|_| BillingError::Internal(format!("invalid customer id: {}", customer_id)))?;

        let user_id_str = user_id.to_string();
        let config = self.stripe.config();

        let mut params = CreateCheckoutSession::new();
        params.mode = Some(CheckoutSessionMode::Subscription);
        params.success_url = Some(&config.checkout_success_url);
        params.cancel_url = Some(&config.checkout_cancel_url);
        params.customer = Some(parsed_customer);
        params.client_reference_id = Some(&user_id_str);
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(price_id.to_string()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(HashMap::from([(
            "user_id".to_string(),
            user_id.to_string(),
        )]));

        let session = CheckoutSession::create(self.stripe.inner(), params).await?;
        let session_id = session.id.to_string();

        sqlx::query(
            r#"
            INSERT INTO checkout_sessions (stripe_session_id, user_id)
            VALUES ($1, $2)
            ON CONFLICT (stripe_session_id) DO NOTHING
            "#,
        )
        .bind(&session_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            user_id = %user_id,
            session_id = %session_id,
            price_id = %price_id,
            "Checkout session created"
        );

        Ok(CheckoutResponse {
            session_id,
            url: session.url.clone(),
        })
    }

    /// Pull-based sync for a checkout session: re-fetch from Stripe and, if
    /// the checkout completed with a subscription, run the subscription
    /// synchronizer directly. Safe to call any number of times and
    /// regardless of whether the webhooks already arrived.
    pub async fn sync_completed_session(
        &self,
        stripe_session_id: &str,
    ) -> BillingResult<CheckoutSyncResult> {
        let session = self
            .stripe
            .retrieve_checkout_session(stripe_session_id)
            .await?;

        let subscription_id = match &session.subscription {
            Some(Expandable::Id(id)) => Some(id.to_string()),
            Some(Expandable::Object(sub)) => Some(sub.id.to_string()),
            None => None,
        };

        if session.status == Some(CheckoutSessionStatus::Expired) {
            sqlx::query(
                "UPDATE checkout_sessions SET status = 'expired' WHERE stripe_session_id = $1",
            )
            .bind(stripe_session_id)
            .execute(&self.pool)
            .await?;

            tracing::info!(session_id = %stripe_session_id, "Checkout session expired");
            return Ok(CheckoutSyncResult {
                status: "expired".to_string(),
                stripe_subscription_id: None,
            });
        }

        let Some(subscription_id) = subscription_id else {
            tracing::debug!(
                session_id = %stripe_session_id,
                "Checkout session has no subscription yet"
            );
            return Ok(CheckoutSyncResult {
                status: "pending".to_string(),
                stripe_subscription_id: None,
            });
        };

        self.subscriptions
            .sync_from_provider(&subscription_id)
            .await?;

        let mut conn = self.pool.acquire().await?;
        mark_session_completed(&mut conn, stripe_session_id, Some(&subscription_id)).await?;

        tracing::info!(
            session_id = %stripe_session_id,
            subscription_id = %subscription_id,
            "Checkout session reconciled via pull sync"
        );

        Ok(CheckoutSyncResult {
            status: "completed".to_string(),
            stripe_subscription_id: Some(subscription_id),
        })
    }

    /// Pending sessions older than `min_age`, oldest first. Fed to the
    /// worker's reconciliation sweep.
    pub async fn list_pending(
        &self,
        min_age: time::Duration,
        limit: i64,
    ) -> BillingResult<Vec<String>> {
        let cutoff = time::OffsetDateTime::now_utc() - min_age;

        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT stripe_session_id
            FROM checkout_sessions
            WHERE status = 'pending' AND created_at < $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }
}
