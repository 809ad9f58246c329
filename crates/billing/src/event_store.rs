//! Webhook event store / idempotency gate
//!
//! One durable row per Stripe event ID. The `processed` flag transitions
//! false to true exactly once per successful run; redeliveries of an already
//! processed event short-circuit without re-running synchronizers. Raw
//! payloads are retained for audit and replay.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Stored webhook event row.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub processed: bool,
    pub error_message: Option<String>,
    pub received_at: OffsetDateTime,
}

/// Durable idempotency gate keyed by provider event ID.
#[derive(Clone)]
pub struct EventStore {
    pool: PgPool,
}

impl EventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert the event row if this is the first sighting of the event ID.
    ///
    /// Conflict-safe: concurrent deliveries of the same event race on the
    /// unique constraint and exactly one insert wins. Returns whether this
    /// call performed the insert.
    pub async fn record_if_new(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
        received_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO stripe_webhook_events (stripe_event_id, event_type, payload, received_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (stripe_event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(payload)
        .bind(received_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Whether this event has already been fully processed.
    pub async fn is_processed(&self, event_id: &str) -> BillingResult<bool> {
        let processed: Option<bool> = sqlx::query_scalar(
            "SELECT processed FROM stripe_webhook_events WHERE stripe_event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(processed.unwrap_or(false))
    }

    /// Mark the event processed after all synchronizers succeeded.
    pub async fn mark_processed(&self, event_id: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processed = TRUE, error_message = NULL
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record a processing failure. The `processed` flag stays false so the
    /// provider's redelivery (or the worker's retry job) attempts again.
    pub async fn record_failure(&self, event_id: &str, message: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET error_message = $2
            WHERE stripe_event_id = $1 AND NOT processed
            "#,
        )
        .bind(event_id)
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
        let record = sqlx::query_as(
            r#"
            SELECT id, stripe_event_id, event_type, payload, processed, error_message, received_at
            FROM stripe_webhook_events
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// List events that never completed processing, oldest first. Events
    /// younger than `min_age` are skipped, they may still be in flight.
    pub async fn list_unprocessed(
        &self,
        min_age: time::Duration,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let cutoff = OffsetDateTime::now_utc() - min_age;

        let records = sqlx::query_as(
            r#"
            SELECT id, stripe_event_id, event_type, payload, processed, error_message, received_at
            FROM stripe_webhook_events
            WHERE NOT processed AND received_at < $1
            ORDER BY received_at ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}
