//! Invoice projection and synchronizer
//!
//! Invoices are close to an immutable log on the provider side, so the
//! synchronizer upserts directly from the event's embedded object. The local
//! `paid` flag derives from the provider status string, nothing else.

use sqlx::{PgConnection, PgPool};
use stripe::{Expandable, Invoice};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::BillingResult;

/// Local invoice projection row.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct InvoiceRecord {
    pub stripe_invoice_id: String,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub status: Option<String>,
    pub amount_due_cents: i64,
    pub amount_paid_cents: i64,
    pub currency: String,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub hosted_invoice_url: Option<String>,
    pub paid: bool,
    pub attempt_count: i32,
}

/// The paid flag is defined as string equality with the provider's "paid"
/// status, not any amount arithmetic.
pub(crate) fn invoice_is_paid(status: Option<&str>) -> bool {
    status == Some("paid")
}

/// Saturating conversion for the attempt counter column. The provider value
/// is u64; anything beyond i32 pins at the maximum instead of wrapping.
pub(crate) fn attempt_count_column(attempt_count: Option<u64>) -> i32 {
    i32::try_from(attempt_count.unwrap_or(0)).unwrap_or(i32::MAX)
}

fn ts(unix: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(unix).unwrap_or_else(|_| OffsetDateTime::now_utc())
}

fn expandable_customer_id(invoice: &Invoice) -> Option<String> {
    match &invoice.customer {
        Some(Expandable::Id(id)) => Some(id.to_string()),
        Some(Expandable::Object(c)) => Some(c.id.to_string()),
        None => None,
    }
}

fn expandable_subscription_id(invoice: &Invoice) -> Option<String> {
    match &invoice.subscription {
        Some(Expandable::Id(id)) => Some(id.to_string()),
        Some(Expandable::Object(s)) => Some(s.id.to_string()),
        None => None,
    }
}

/// Upsert the invoice projection keyed by the Stripe invoice ID.
pub(crate) async fn upsert_invoice(
    conn: &mut PgConnection,
    invoice: &Invoice,
) -> BillingResult<()> {
    let status = invoice.status.as_ref().map(|s| s.to_string());
    let paid = invoice_is_paid(status.as_deref());

    let currency = invoice
        .currency
        .as_ref()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "usd".to_string());

    sqlx::query(
        r#"
        INSERT INTO invoices (
            stripe_invoice_id, stripe_customer_id, stripe_subscription_id, status,
            amount_due_cents, amount_paid_cents, currency,
            period_start, period_end, hosted_invoice_url, invoice_pdf_url,
            paid, attempt_count
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        ON CONFLICT (stripe_invoice_id) DO UPDATE SET
            stripe_customer_id = EXCLUDED.stripe_customer_id,
            stripe_subscription_id = EXCLUDED.stripe_subscription_id,
            status = EXCLUDED.status,
            amount_due_cents = EXCLUDED.amount_due_cents,
            amount_paid_cents = EXCLUDED.amount_paid_cents,
            currency = EXCLUDED.currency,
            period_start = EXCLUDED.period_start,
            period_end = EXCLUDED.period_end,
            hosted_invoice_url = EXCLUDED.hosted_invoice_url,
            invoice_pdf_url = EXCLUDED.invoice_pdf_url,
            paid = EXCLUDED.paid,
            attempt_count = EXCLUDED.attempt_count,
            updated_at = NOW()
        "#,
    )
    .bind(invoice.id.as_str())
    .bind(expandable_customer_id(invoice))
    .bind(expandable_subscription_id(invoice))
    .bind(status)
    .bind(invoice.amount_due.unwrap_or(0))
    .bind(invoice.amount_paid.unwrap_or(0))
    .bind(currency)
    .bind(invoice.period_start.map(ts))
    .bind(invoice.period_end.map(ts))
    .bind(invoice.hosted_invoice_url.as_ref())
    .bind(invoice.invoice_pdf.as_ref())
    .bind(paid)
    .bind(attempt_count_column(invoice.attempt_count))
    .execute(conn)
    .await?;

    Ok(())
}

/// Invoice operations against Stripe and the local projection.
#[derive(Clone)]
pub struct InvoiceService {
    stripe: StripeClient,
    pool: PgPool,
}

impl InvoiceService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Re-fetch a single invoice from Stripe and upsert the projection.
    pub async fn sync_from_provider(&self, stripe_invoice_id: &str) -> BillingResult<()> {
        let invoice = self.stripe.retrieve_invoice(stripe_invoice_id).await?;

        let mut conn = self.pool.acquire().await?;
        upsert_invoice(&mut conn, &invoice).await?;

        tracing::info!(invoice_id = %stripe_invoice_id, "Invoice synced from provider");
        Ok(())
    }

    /// Billing history for a user, newest first, joined through the
    /// customer projection.
    pub async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<InvoiceRecord>> {
        let records = sqlx::query_as(
            r#"
            SELECT i.stripe_invoice_id, i.stripe_customer_id, i.stripe_subscription_id, i.status,
                   i.amount_due_cents, i.amount_paid_cents, i.currency,
                   i.period_start, i.period_end, i.hosted_invoice_url,
                   i.paid, i.attempt_count
            FROM invoices i
            JOIN billing_customers c ON c.stripe_customer_id = i.stripe_customer_id
            WHERE c.user_id = $1
            ORDER BY i.created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}
