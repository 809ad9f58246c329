//! Subscription projection and synchronizer
//!
//! The local row always reflects Stripe's last-known authoritative state at
//! the time of the last sync. Mutable fields are only ever written from an
//! object that arrived inside a signed webhook event or was re-fetched from
//! the provider; the one exception is deletion, which is terminal and applied
//! directly from the payload (a re-fetch would 404).

use sqlx::{PgConnection, PgPool};
use stripe::{Expandable, Subscription, SubscriptionStatus as StripeSubStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::customers;
use crate::error::{BillingError, BillingResult};

/// Local subscription projection row.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct SubscriptionRecord {
    pub user_id: Uuid,
    pub stripe_subscription_id: String,
    pub stripe_customer_id: String,
    pub stripe_price_id: Option<String>,
    pub status: String,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
}

/// Map the provider status enum to the string stored locally.
pub(crate) fn subscription_status_str(status: StripeSubStatus) -> &'static str {
    match status {
        StripeSubStatus::Active => "active",
        StripeSubStatus::PastDue => "past_due",
        StripeSubStatus::Canceled => "canceled",
        StripeSubStatus::Unpaid => "unpaid",
        StripeSubStatus::Trialing => "trialing",
        StripeSubStatus::Incomplete => "incomplete",
        StripeSubStatus::IncompleteExpired => "incomplete_expired",
        StripeSubStatus::Paused => "paused",
    }
}

/// The Stripe customer ID a subscription belongs to.
pub(crate) fn customer_id_of(subscription: &Subscription) -> String {
    match &subscription.customer {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(customer) => customer.id.to_string(),
    }
}

fn ts(unix: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(unix).unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// Upsert the subscription projection keyed by the Stripe subscription ID.
///
/// Single atomic statement: insert if absent, overwrite mutable fields if
/// present. Concurrent deliveries for the same subscription serialize on the
/// unique constraint instead of racing a read-then-branch.
pub(crate) async fn upsert_subscription(
    conn: &mut PgConnection,
    user_id: Uuid,
    subscription: &Subscription,
) -> BillingResult<()> {
    let status = subscription_status_str(subscription.status);
    let customer_id = customer_id_of(subscription);

    let price_id = subscription
        .items
        .data
        .first()
        .and_then(|item| item.price.as_ref())
        .map(|p| p.id.to_string());

    let canceled_at = subscription.canceled_at.map(ts);
    let trial_start = subscription.trial_start.map(ts);
    let trial_end = subscription.trial_end.map(ts);

    sqlx::query(
        r#"
        INSERT INTO subscriptions (
            user_id, stripe_subscription_id, stripe_customer_id, stripe_price_id, status,
            current_period_start, current_period_end, cancel_at_period_end,
            canceled_at, trial_start, trial_end
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (stripe_subscription_id) DO UPDATE SET
            user_id = EXCLUDED.user_id,
            stripe_customer_id = EXCLUDED.stripe_customer_id,
            stripe_price_id = EXCLUDED.stripe_price_id,
            status = EXCLUDED.status,
            current_period_start = EXCLUDED.current_period_start,
            current_period_end = EXCLUDED.current_period_end,
            cancel_at_period_end = EXCLUDED.cancel_at_period_end,
            canceled_at = EXCLUDED.canceled_at,
            trial_start = EXCLUDED.trial_start,
            trial_end = EXCLUDED.trial_end,
            updated_at = NOW()
        "#,
    )
    .bind(user_id)
    .bind(subscription.id.as_str())
    .bind(&customer_id)
    .bind(price_id)
    .bind(status)
    .bind(ts(subscription.current_period_start))
    .bind(ts(subscription.current_period_end))
    .bind(subscription.cancel_at_period_end)
    .bind(canceled_at)
    .bind(trial_start)
    .bind(trial_end)
    .execute(conn)
    .await?;

    Ok(())
}

/// Resolve the owning user for a subscription's customer, failing with
/// `DanglingReference` when the customer row has not arrived yet.
pub(crate) async fn resolve_owner(
    conn: &mut PgConnection,
    subscription: &Subscription,
) -> BillingResult<Uuid> {
    let customer_id = customer_id_of(subscription);

    customers::find_user_for_customer(conn, &customer_id)
        .await?
        .ok_or(BillingError::DanglingReference {
            entity: "subscription",
            reference: customer_id,
        })
}

/// Terminal write for `customer.subscription.deleted`. Applied directly from
/// the payload: deletion is unambiguous and a re-fetch would 404. Returns
/// whether a local row was updated.
pub(crate) async fn mark_canceled(
    conn: &mut PgConnection,
    stripe_subscription_id: &str,
    canceled_at: OffsetDateTime,
) -> BillingResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE subscriptions
        SET status = 'canceled', canceled_at = $2, updated_at = NOW()
        WHERE stripe_subscription_id = $1
        "#,
    )
    .bind(stripe_subscription_id)
    .bind(canceled_at)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Subscription operations against Stripe and the local projection.
#[derive(Clone)]
pub struct SubscriptionService {
    stripe: StripeClient,
    pool: PgPool,
}

impl SubscriptionService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Pull-based sync: re-fetch the subscription from Stripe and upsert the
    /// local projection. Used by the checkout return flow and the worker's
    /// reconciliation sweep, independent of webhook delivery order.
    pub async fn sync_from_provider(&self, stripe_subscription_id: &str) -> BillingResult<()> {
        let subscription = self
            .stripe
            .retrieve_subscription(stripe_subscription_id)
            .await?;

        let mut conn = self.pool.acquire().await?;
        let user_id = resolve_owner(&mut conn, &subscription).await?;
        upsert_subscription(&mut conn, user_id, &subscription).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %stripe_subscription_id,
            status = %subscription_status_str(subscription.status),
            "Subscription synced from provider"
        );

        Ok(())
    }

    /// Cancel a subscription, either at period end (default) or immediately,
    /// then sync the provider's response into the local projection.
    pub async fn cancel(
        &self,
        stripe_subscription_id: &str,
        immediately: bool,
    ) -> BillingResult<SubscriptionRecord> {
        let subscription = if immediately {
            self.stripe
                .cancel_subscription(stripe_subscription_id)
                .await?
        } else {
            self.stripe
                .cancel_subscription_at_period_end(stripe_subscription_id)
                .await?
        };

        let mut conn = self.pool.acquire().await?;
        let user_id = resolve_owner(&mut conn, &subscription).await?;
        upsert_subscription(&mut conn, user_id, &subscription).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %stripe_subscription_id,
            immediately = immediately,
            "Subscription cancellation requested"
        );

        self.get(stripe_subscription_id).await?.ok_or_else(|| {
            BillingError::NotFound(format!("subscription {}", stripe_subscription_id))
        })
    }

    pub async fn get(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record = sqlx::query_as(
            r#"
            SELECT user_id, stripe_subscription_id, stripe_customer_id, stripe_price_id, status,
                   current_period_start, current_period_end, cancel_at_period_end,
                   canceled_at, trial_start, trial_end
            FROM subscriptions
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Most recent subscription for a user, for API display.
    pub async fn get_for_user(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        let record = sqlx::query_as(
            r#"
            SELECT user_id, stripe_subscription_id, stripe_customer_id, stripe_price_id, status,
                   current_period_start, current_period_end, cancel_at_period_end,
                   canceled_at, trial_start, trial_end
            FROM subscriptions
            WHERE user_id = $1
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }
}
