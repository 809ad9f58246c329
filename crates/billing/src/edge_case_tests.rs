// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Webhook Pipeline
//!
//! Boundary conditions around signature verification, the idempotency gate,
//! and the entity synchronizers:
//! - Signature verification (BILL-W01 to BILL-W07)
//! - Error classification (BILL-E01 to BILL-E02)
//! - Event store and synchronizers against Postgres (BILL-S01 to BILL-S07)
//!
//! Signatures are forged locally with the same HMAC construction Stripe
//! uses, so verification runs against real header material without network.
//! Database-backed tests use `#[sqlx::test]` with the shared migrations.

use crate::client::{StripeClient, StripeConfig};
use crate::webhooks::WebhookHandler;
use hmac::{Hmac, Mac};
use sha2::Sha256;

const WEBHOOK_SECRET: &str = "whsec_test_secret_for_forged_payloads";

fn test_config() -> StripeConfig {
    StripeConfig {
        secret_key: "sk_test_dummy".to_string(),
        webhook_secret: WEBHOOK_SECRET.to_string(),
        product_id: "prod_dummy".to_string(),
        checkout_success_url: "https://parley.test/billing/success".to_string(),
        checkout_cancel_url: "https://parley.test/billing/cancel".to_string(),
    }
}

fn handler_with_pool(pool: sqlx::PgPool) -> WebhookHandler {
    WebhookHandler::new(StripeClient::new(test_config()), pool)
}

/// Forge a `Stripe-Signature` header: v1 HMAC-SHA256 over
/// `{timestamp}.{payload}` keyed with the full secret string.
fn sign(payload: &str, secret: &str, timestamp: i64) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    let digest = hex::encode(mac.finalize().into_bytes());
    format!("t={},v1={}", timestamp, digest)
}

fn now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

fn event_envelope(event_id: &str, event_type: &str, created: i64, object: serde_json::Value) -> String {
    serde_json::json!({
        "id": event_id,
        "object": "event",
        "api_version": "2023-10-16",
        "created": created,
        "data": { "object": object },
        "livemode": false,
        "pending_webhooks": 1,
        "request": null,
        "type": event_type
    })
    .to_string()
}

fn customer_object(customer_id: &str) -> serde_json::Value {
    serde_json::json!({
        "id": customer_id,
        "object": "customer"
    })
}

#[cfg(test)]
mod signature_tests {
    use super::*;
    use crate::error::BillingError;

    fn test_handler() -> WebhookHandler {
        // Lazy pool: never connects, signature verification touches no DB.
        let pool = sqlx::PgPool::connect_lazy("postgres://parley@localhost/parley_test").unwrap();
        handler_with_pool(pool)
    }

    fn event_payload(event_id: &str, event_type: &str, created: i64) -> String {
        event_envelope(event_id, event_type, created, customer_object("cus_edge_case"))
    }

    // =========================================================================
    // BILL-W01: Correctly signed, well-formed payload verifies and parses
    // =========================================================================
    #[tokio::test]
    async fn test_valid_signature_accepted() {
        let handler = test_handler();
        let ts = now();
        let payload = event_payload("evt_w01", "customer.created", ts);
        let signature = sign(&payload, WEBHOOK_SECRET, ts);

        let event = handler.verify_event(&payload, &signature).unwrap();
        assert_eq!(event.id.as_str(), "evt_w01");
        assert_eq!(event.type_, stripe::EventType::CustomerCreated);
    }

    // =========================================================================
    // BILL-W02: Payload tampered after signing - rejected
    // =========================================================================
    #[tokio::test]
    async fn test_tampered_payload_rejected() {
        let handler = test_handler();
        let ts = now();
        let payload = event_payload("evt_w02", "customer.created", ts);
        let signature = sign(&payload, WEBHOOK_SECRET, ts);

        let tampered = payload.replace("cus_edge_case", "cus_attacker");
        let err = handler.verify_event(&tampered, &signature).unwrap_err();
        assert!(matches!(err, BillingError::InvalidSignature));
    }

    // =========================================================================
    // BILL-W03: Signed with the wrong secret - rejected
    // =========================================================================
    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let handler = test_handler();
        let ts = now();
        let payload = event_payload("evt_w03", "customer.created", ts);
        let signature = sign(&payload, "whsec_some_other_secret", ts);

        let err = handler.verify_event(&payload, &signature).unwrap_err();
        assert!(matches!(err, BillingError::InvalidSignature));
    }

    // =========================================================================
    // BILL-W04: Stale timestamp outside the tolerance window - rejected
    // =========================================================================
    #[tokio::test]
    async fn test_stale_timestamp_rejected() {
        let handler = test_handler();
        let stale = now() - 3600;
        let payload = event_payload("evt_w04", "customer.created", stale);
        let signature = sign(&payload, WEBHOOK_SECRET, stale);

        let err = handler.verify_event(&payload, &signature).unwrap_err();
        assert!(matches!(err, BillingError::InvalidSignature));
    }

    // =========================================================================
    // BILL-W05: Garbage signature header - rejected without parsing payload
    // =========================================================================
    #[tokio::test]
    async fn test_malformed_signature_header_rejected() {
        let handler = test_handler();
        let payload = event_payload("evt_w05", "customer.created", now());

        for header in ["", "not-a-header", "t=abc,v1=zzz", "v1=deadbeef"] {
            let err = handler.verify_event(&payload, header).unwrap_err();
            assert!(
                matches!(err, BillingError::InvalidSignature),
                "header {:?} should fail as InvalidSignature",
                header
            );
        }
    }

    // =========================================================================
    // BILL-W06: Valid signature over JSON that is not an event envelope
    // =========================================================================
    #[tokio::test]
    async fn test_signed_garbage_json_is_malformed_payload() {
        let handler = test_handler();
        let ts = now();
        let payload = r#"{"hello": "world"}"#;
        let signature = sign(payload, WEBHOOK_SECRET, ts);

        let err = handler.verify_event(payload, &signature).unwrap_err();
        assert!(matches!(err, BillingError::MalformedPayload(_)));
    }

    // =========================================================================
    // BILL-W07: Valid signature over non-JSON bytes
    // =========================================================================
    #[tokio::test]
    async fn test_signed_non_json_is_rejected() {
        let handler = test_handler();
        let ts = now();
        let payload = "this is not json at all";
        let signature = sign(payload, WEBHOOK_SECRET, ts);

        let err = handler.verify_event(payload, &signature).unwrap_err();
        assert!(matches!(
            err,
            BillingError::MalformedPayload(_) | BillingError::InvalidSignature
        ));
    }
}

#[cfg(test)]
mod error_classification_tests {
    use crate::error::BillingError;

    // =========================================================================
    // BILL-E01: Verification failures are terminal client errors
    // =========================================================================
    #[test]
    fn test_verification_failures_are_client_errors() {
        assert!(BillingError::InvalidSignature.is_client_error());
        assert!(BillingError::MalformedPayload("missing field `id`".into()).is_client_error());
    }

    // =========================================================================
    // BILL-E02: Synchronizer failures are retryable server errors
    // =========================================================================
    #[test]
    fn test_synchronizer_failures_are_retryable() {
        let dangling = BillingError::DanglingReference {
            entity: "subscription",
            reference: "cus_unseen".into(),
        };
        assert!(!dangling.is_client_error());
        assert!(!BillingError::Internal("synchronizer panicked".into()).is_client_error());
    }
}

#[cfg(test)]
mod store_and_synchronizer_tests {
    use super::*;
    use crate::customers::{find_user_for_customer, upsert_customer};
    use crate::error::BillingError;
    use crate::event_store::EventStore;
    use crate::subscriptions::{mark_canceled, resolve_owner, upsert_subscription};
    use sqlx::PgPool;
    use stripe::{Expandable, Subscription, SubscriptionStatus};
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn subscription_fixture(
        id: &str,
        customer_id: &str,
        status: SubscriptionStatus,
    ) -> Subscription {
        let mut subscription = Subscription::default();
        subscription.id = id.parse().unwrap();
        subscription.customer = Expandable::Id(customer_id.parse().unwrap());
        subscription.status = status;
        subscription.created = 1_700_000_000;
        subscription.current_period_start = 1_700_000_000;
        subscription.current_period_end = 1_702_592_000;
        subscription
    }

    async fn event_row_count(pool: &PgPool, event_id: &str) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM stripe_webhook_events WHERE stripe_event_id = $1")
            .bind(event_id)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    // =========================================================================
    // BILL-S01: Double delivery - second record_if_new is a no-op, processed
    //           transitions false to true exactly once
    // =========================================================================
    #[sqlx::test(migrations = "../shared/migrations")]
    async fn test_double_delivery_records_once(pool: PgPool) {
        let store = EventStore::new(pool.clone());
        let payload = serde_json::json!({"id": "evt_s01"});
        let received_at = OffsetDateTime::now_utc();

        assert!(store
            .record_if_new("evt_s01", "customer.created", &payload, received_at)
            .await
            .unwrap());
        assert!(!store
            .record_if_new("evt_s01", "customer.created", &payload, received_at)
            .await
            .unwrap());
        assert_eq!(event_row_count(&pool, "evt_s01").await, 1);

        assert!(!store.is_processed("evt_s01").await.unwrap());
        store.mark_processed("evt_s01").await.unwrap();
        assert!(store.is_processed("evt_s01").await.unwrap());
    }

    // =========================================================================
    // BILL-S02: record_failure annotates the row but leaves it unprocessed
    // =========================================================================
    #[sqlx::test(migrations = "../shared/migrations")]
    async fn test_failure_leaves_event_unprocessed(pool: PgPool) {
        let store = EventStore::new(pool.clone());
        let payload = serde_json::json!({"id": "evt_s02"});

        store
            .record_if_new("evt_s02", "invoice.paid", &payload, OffsetDateTime::now_utc())
            .await
            .unwrap();
        store
            .record_failure("evt_s02", "missing parent row")
            .await
            .unwrap();

        let record = store.get("evt_s02").await.unwrap().unwrap();
        assert!(!record.processed);
        assert_eq!(record.error_message.as_deref(), Some("missing parent row"));

        // Listed for replay once old enough, invisible while fresh.
        let fresh = store.list_unprocessed(time::Duration::minutes(5), 10).await.unwrap();
        assert!(fresh.is_empty());
        let due = store.list_unprocessed(time::Duration::seconds(-60), 10).await.unwrap();
        assert_eq!(due.len(), 1);

        // Success clears the annotation.
        store.mark_processed("evt_s02").await.unwrap();
        let record = store.get("evt_s02").await.unwrap().unwrap();
        assert!(record.processed);
        assert!(record.error_message.is_none());
    }

    // =========================================================================
    // BILL-S03: Customer upsert applied twice converges on the latest state
    // =========================================================================
    #[sqlx::test(migrations = "../shared/migrations")]
    async fn test_customer_upsert_is_idempotent(pool: PgPool) {
        let user_id = Uuid::new_v4();
        let mut conn = pool.acquire().await.unwrap();

        upsert_customer(&mut conn, user_id, "cus_s03", "old@example.com", None)
            .await
            .unwrap();
        upsert_customer(&mut conn, user_id, "cus_s03", "new@example.com", Some("Ada"))
            .await
            .unwrap();

        let (count, email): (i64, String) = sqlx::query_as(
            "SELECT COUNT(*) OVER (), email FROM billing_customers WHERE stripe_customer_id = $1",
        )
        .bind("cus_s03")
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1);
        assert_eq!(email, "new@example.com");
    }

    // =========================================================================
    // BILL-S04: Subscription upsert applied twice - one row, latest status
    //           and period bounds win
    // =========================================================================
    #[sqlx::test(migrations = "../shared/migrations")]
    async fn test_subscription_upsert_is_idempotent(pool: PgPool) {
        let user_id = Uuid::new_v4();
        let mut conn = pool.acquire().await.unwrap();
        upsert_customer(&mut conn, user_id, "cus_s04", "s04@example.com", None)
            .await
            .unwrap();

        let active = subscription_fixture("sub_s04", "cus_s04", SubscriptionStatus::Active);
        upsert_subscription(&mut conn, user_id, &active).await.unwrap();

        let mut past_due = subscription_fixture("sub_s04", "cus_s04", SubscriptionStatus::PastDue);
        past_due.current_period_start = 1_702_592_000;
        past_due.current_period_end = 1_705_270_400;
        upsert_subscription(&mut conn, user_id, &past_due).await.unwrap();

        let (count, status, period_end): (i64, String, Option<OffsetDateTime>) = sqlx::query_as(
            r#"
            SELECT COUNT(*) OVER (), status, current_period_end
            FROM subscriptions WHERE stripe_subscription_id = $1
            "#,
        )
        .bind("sub_s04")
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1);
        assert_eq!(status, "past_due");
        assert_eq!(
            period_end.map(|t| t.unix_timestamp()),
            Some(1_705_270_400)
        );
    }

    // =========================================================================
    // BILL-S05: Deletion is terminal regardless of prior status
    // =========================================================================
    #[sqlx::test(migrations = "../shared/migrations")]
    async fn test_deletion_is_terminal(pool: PgPool) {
        let user_id = Uuid::new_v4();
        let mut conn = pool.acquire().await.unwrap();
        upsert_customer(&mut conn, user_id, "cus_s05", "s05@example.com", None)
            .await
            .unwrap();

        let past_due = subscription_fixture("sub_s05", "cus_s05", SubscriptionStatus::PastDue);
        upsert_subscription(&mut conn, user_id, &past_due).await.unwrap();

        let canceled_at = OffsetDateTime::now_utc();
        assert!(mark_canceled(&mut conn, "sub_s05", canceled_at).await.unwrap());

        let (status, stored_canceled_at): (String, Option<OffsetDateTime>) = sqlx::query_as(
            "SELECT status, canceled_at FROM subscriptions WHERE stripe_subscription_id = $1",
        )
        .bind("sub_s05")
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(status, "canceled");
        assert!(stored_canceled_at.is_some());

        // Unknown subscription: nothing to cancel, caller is told so.
        assert!(!mark_canceled(&mut conn, "sub_never_seen", canceled_at).await.unwrap());
    }

    // =========================================================================
    // BILL-S06: Missing parent customer - DanglingReference until the
    //           customer row lands, then resolution succeeds
    // =========================================================================
    #[sqlx::test(migrations = "../shared/migrations")]
    async fn test_dangling_reference_resolves_after_parent_arrives(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let subscription =
            subscription_fixture("sub_s06", "cus_s06_late", SubscriptionStatus::Active);

        let err = resolve_owner(&mut conn, &subscription).await.unwrap_err();
        assert!(matches!(
            err,
            BillingError::DanglingReference { entity: "subscription", ref reference }
                if reference == "cus_s06_late"
        ));
        assert!(find_user_for_customer(&mut conn, "cus_s06_late")
            .await
            .unwrap()
            .is_none());

        let user_id = Uuid::new_v4();
        upsert_customer(&mut conn, user_id, "cus_s06_late", "late@example.com", None)
            .await
            .unwrap();
        assert_eq!(resolve_owner(&mut conn, &subscription).await.unwrap(), user_id);
    }

    // =========================================================================
    // BILL-S07: Full pipeline - processed replay short-circuits, the stored
    //           received_at reflects receipt rather than the provider's
    //           creation time, and the projection lands
    // =========================================================================
    #[sqlx::test(migrations = "../shared/migrations")]
    async fn test_pipeline_idempotency_and_receipt_time(pool: PgPool) {
        let handler = handler_with_pool(pool.clone());
        let user_id = Uuid::new_v4();

        // Stripe created the event a day ago; it only reaches us now.
        let created = now() - 86_400;
        let object = serde_json::json!({
            "id": "cus_s07",
            "object": "customer",
            "email": "s07@example.com",
            "name": "Grace",
            "metadata": { "user_id": user_id.to_string() }
        });
        let payload = event_envelope("evt_s07", "customer.created", created, object);
        let signature = sign(&payload, WEBHOOK_SECRET, now());

        let event = handler.verify_event(&payload, &signature).unwrap();
        let outcome = handler.handle_event(&payload, event).await.unwrap();
        assert!(outcome.processed);

        let record = handler.events().get("evt_s07").await.unwrap().unwrap();
        assert!(record.processed);
        assert!(record.received_at > OffsetDateTime::now_utc() - time::Duration::minutes(1));

        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(
            find_user_for_customer(&mut conn, "cus_s07").await.unwrap(),
            Some(user_id)
        );

        // Redelivery of the processed event: acknowledged, no second row.
        let event = handler.verify_event(&payload, &signature).unwrap();
        let outcome = handler.handle_event(&payload, event).await.unwrap();
        assert!(outcome.processed);
        assert_eq!(event_row_count(&pool, "evt_s07").await, 1);
    }
}
