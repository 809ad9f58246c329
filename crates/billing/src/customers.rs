//! Customer projection and synchronizer
//!
//! One local row per Stripe customer ID, correlated to a Parley user via the
//! `user_id` metadata key we set at customer creation. Rows are created
//! lazily at first checkout and kept current by customer webhook events.

use std::collections::HashMap;

use sqlx::{PgConnection, PgPool};
use stripe::{CreateCustomer, Customer};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::BillingResult;

/// Extract the owning user ID from Stripe customer metadata.
pub(crate) fn user_id_from_metadata(metadata: Option<&HashMap<String, String>>) -> Option<Uuid> {
    metadata
        .and_then(|m| m.get("user_id"))
        .and_then(|id| Uuid::parse_str(id).ok())
}

/// Resolve the owning user for a Stripe customer from the local projection.
pub(crate) async fn find_user_for_customer(
    conn: &mut PgConnection,
    stripe_customer_id: &str,
) -> BillingResult<Option<Uuid>> {
    let user_id: Option<Uuid> =
        sqlx::query_scalar("SELECT user_id FROM billing_customers WHERE stripe_customer_id = $1")
            .bind(stripe_customer_id)
            .fetch_optional(conn)
            .await?;

    Ok(user_id)
}

/// Upsert the local customer row keyed by the Stripe customer ID.
///
/// Single atomic statement, safe under concurrent webhook deliveries.
pub(crate) async fn upsert_customer(
    conn: &mut PgConnection,
    user_id: Uuid,
    stripe_customer_id: &str,
    email: &str,
    name: Option<&str>,
) -> BillingResult<()> {
    sqlx::query(
        r#"
        INSERT INTO billing_customers (user_id, stripe_customer_id, email, name)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (stripe_customer_id) DO UPDATE SET
            user_id = EXCLUDED.user_id,
            email = EXCLUDED.email,
            name = EXCLUDED.name,
            updated_at = NOW()
        "#,
    )
    .bind(user_id)
    .bind(stripe_customer_id)
    .bind(email)
    .bind(name)
    .execute(conn)
    .await?;

    Ok(())
}

/// Soft acknowledgment of a provider-side customer deletion: bump the local
/// row's updated timestamp, never hard-delete. Returns whether a row existed.
pub(crate) async fn touch_customer(
    conn: &mut PgConnection,
    stripe_customer_id: &str,
) -> BillingResult<bool> {
    let result =
        sqlx::query("UPDATE billing_customers SET updated_at = NOW() WHERE stripe_customer_id = $1")
            .bind(stripe_customer_id)
            .execute(conn)
            .await?;

    Ok(result.rows_affected() > 0)
}

/// Customer-facing operations against Stripe and the local projection.
#[derive(Clone)]
pub struct CustomerService {
    stripe: StripeClient,
    pool: PgPool,
}

impl CustomerService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Return the Stripe customer ID for a user, creating the customer on
    /// first use. Creation stamps the `user_id` metadata key so webhook
    /// events can be correlated back to the owning user.
    pub async fn get_or_create(
        &self,
        user_id: Uuid,
        email: &str,
        name: Option<&str>,
    ) -> BillingResult<String> {
        let existing: Option<String> = sqlx::query_scalar(
            "SELECT stripe_customer_id FROM billing_customers WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(customer_id) = existing {
            return Ok(customer_id);
        }

        let mut params = CreateCustomer::new();
        params.email = Some(email);
        params.name = name;
        params.metadata = Some(HashMap::from([(
            "user_id".to_string(),
            user_id.to_string(),
        )]));

        let customer = Customer::create(self.stripe.inner(), params).await?;
        let customer_id = customer.id.to_string();

        let mut conn = self.pool.acquire().await?;
        upsert_customer(&mut conn, user_id, &customer_id, email, name).await?;

        tracing::info!(
            user_id = %user_id,
            customer_id = %customer_id,
            "Created Stripe customer"
        );

        Ok(customer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_extracted_from_metadata() {
        let user_id = Uuid::new_v4();
        let metadata = HashMap::from([("user_id".to_string(), user_id.to_string())]);
        assert_eq!(user_id_from_metadata(Some(&metadata)), Some(user_id));
    }

    #[test]
    fn missing_or_invalid_metadata_yields_none() {
        assert_eq!(user_id_from_metadata(None), None);

        let empty = HashMap::new();
        assert_eq!(user_id_from_metadata(Some(&empty)), None);

        let garbage = HashMap::from([("user_id".to_string(), "not-a-uuid".to_string())]);
        assert_eq!(user_id_from_metadata(Some(&garbage)), None);
    }
}
