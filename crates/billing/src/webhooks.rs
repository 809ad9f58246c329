//! Webhook intake pipeline
//!
//! Verification, the idempotency gate, and dispatch to the entity
//! synchronizers. The pipeline per delivery:
//!
//! 1. Verify the signature through the SDK. Failure is terminal, nothing is
//!    stored.
//! 2. Short-circuit if the event ID was already processed.
//! 3. Record the raw event durably, conflict-safe against concurrent
//!    deliveries of the same ID.
//! 4. Run the matching synchronizers inside a single transaction.
//! 5. On success flip `processed`; on failure record the error and leave the
//!    event unprocessed so Stripe's redelivery (or our retry job) tries again.
//!
//! Unrecognized event types acknowledge without side effects, otherwise every
//! subscription of a new event category in the Stripe dashboard would turn
//! into an error flood.

use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use stripe::{Event, EventObject, EventType, Webhook, WebhookError};
use time::OffsetDateTime;

use crate::client::StripeClient;
use crate::customers;
use crate::error::{BillingError, BillingResult};
use crate::event_store::EventStore;
use crate::{checkout, invoices, subscriptions};

/// What the dispatcher does for a given event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncAction {
    /// Upsert the subscription projection from the event object.
    SyncSubscription,
    /// Terminal cancellation write, applied directly from the payload.
    RemoveSubscription,
    /// Upsert the invoice projection from the event object.
    SyncInvoice,
    /// Upsert the customer projection from the event object.
    SyncCustomer,
    /// Acknowledge a provider-side customer deletion without deleting locally.
    TouchCustomer,
    /// Mark a tracked checkout session completed.
    CompleteCheckout,
    /// Log and acknowledge, no state change.
    Acknowledge,
}

/// Closed dispatch table. Every type Stripe is configured to send has an
/// explicit arm; anything else acknowledges without side effects.
pub(crate) fn action_for(event_type: &EventType) -> SyncAction {
    match event_type {
        EventType::CustomerSubscriptionCreated
        | EventType::CustomerSubscriptionUpdated
        | EventType::CustomerSubscriptionPaused
        | EventType::CustomerSubscriptionResumed => SyncAction::SyncSubscription,

        EventType::CustomerSubscriptionDeleted => SyncAction::RemoveSubscription,

        EventType::InvoicePaid
        | EventType::InvoicePaymentFailed
        | EventType::InvoicePaymentActionRequired => SyncAction::SyncInvoice,

        EventType::CustomerCreated | EventType::CustomerUpdated => SyncAction::SyncCustomer,
        EventType::CustomerDeleted => SyncAction::TouchCustomer,

        EventType::CheckoutSessionCompleted => SyncAction::CompleteCheckout,

        EventType::PaymentIntentSucceeded | EventType::PaymentIntentPaymentFailed => {
            SyncAction::Acknowledge
        }

        _ => SyncAction::Acknowledge,
    }
}

/// Summary of a handled delivery, echoed back to Stripe in the response body.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WebhookOutcome {
    pub event_id: String,
    pub event_type: String,
    pub processed: bool,
}

/// Webhook verification and processing.
#[derive(Clone)]
pub struct WebhookHandler {
    stripe: StripeClient,
    pool: PgPool,
    events: EventStore,
}

impl WebhookHandler {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let events = EventStore::new(pool.clone());
        Self {
            stripe,
            pool,
            events,
        }
    }

    pub fn events(&self) -> &EventStore {
        &self.events
    }

    /// Verify the delivery signature and parse the event envelope.
    ///
    /// Verification is delegated entirely to the SDK: it checks the v1 HMAC
    /// over `{timestamp}.{payload}` and enforces the timestamp tolerance.
    /// A payload that fails JSON parsing after a valid signature maps to
    /// `MalformedPayload`; every other failure is `InvalidSignature`.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let webhook_secret = &self.stripe.config().webhook_secret;

        Webhook::construct_event(payload, signature, webhook_secret).map_err(|err| match err {
            WebhookError::BadParse(parse_err) => {
                BillingError::MalformedPayload(parse_err.to_string())
            }
            other => {
                tracing::warn!(error = %other, "Webhook signature verification failed");
                BillingError::InvalidSignature
            }
        })
    }

    /// Process one verified delivery end to end. Returns the outcome echoed
    /// to the provider; errors propagate so the HTTP layer can answer 5xx
    /// and trigger redelivery.
    pub async fn handle_event(&self, payload: &str, event: Event) -> BillingResult<WebhookOutcome> {
        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();

        if self.events.is_processed(&event_id).await? {
            tracing::debug!(event_id = %event_id, "Duplicate delivery, already processed");
            return Ok(WebhookOutcome {
                event_id,
                event_type,
                processed: true,
            });
        }

        let payload_json: Value = serde_json::from_str(payload)
            .map_err(|e| BillingError::MalformedPayload(e.to_string()))?;

        // Receipt time, not the provider's creation time: retry age is
        // measured from when the delivery reached us.
        let received_at = OffsetDateTime::now_utc();

        let first_sighting = self
            .events
            .record_if_new(&event_id, &event_type, &payload_json, received_at)
            .await?;
        if !first_sighting {
            tracing::debug!(event_id = %event_id, "Redelivery of an unprocessed event, retrying");
        }

        self.run_synchronizers(&event).await?;

        Ok(WebhookOutcome {
            event_id,
            event_type,
            processed: true,
        })
    }

    /// Re-run an event from its stored payload. Used by the worker's retry
    /// job for events whose first processing attempt failed.
    pub async fn replay_event(&self, event_id: &str) -> BillingResult<WebhookOutcome> {
        let record = self
            .events
            .get(event_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("webhook event {}", event_id)))?;

        if record.processed {
            return Ok(WebhookOutcome {
                event_id: record.stripe_event_id,
                event_type: record.event_type,
                processed: true,
            });
        }

        let event: Event = serde_json::from_value(record.payload)
            .map_err(|e| BillingError::MalformedPayload(e.to_string()))?;

        self.run_synchronizers(&event).await?;

        Ok(WebhookOutcome {
            event_id: record.stripe_event_id,
            event_type: record.event_type,
            processed: true,
        })
    }

    /// Dispatch the event to its synchronizers inside one transaction and
    /// settle the event store row either way.
    async fn run_synchronizers(&self, event: &Event) -> BillingResult<()> {
        let event_id = event.id.to_string();

        match self.dispatch(event).await {
            Ok(()) => {
                self.events.mark_processed(&event_id).await?;
                tracing::info!(
                    event_id = %event_id,
                    event_type = %event.type_,
                    "Webhook event processed"
                );
                Ok(())
            }
            Err(err) => {
                tracing::error!(
                    event_id = %event_id,
                    event_type = %event.type_,
                    error = %err,
                    "Webhook event processing failed, left unprocessed for retry"
                );
                self.events.record_failure(&event_id, &err.to_string()).await?;
                Err(err)
            }
        }
    }

    /// All writes for one event share a transaction, so a failing
    /// synchronizer leaves no partial projection behind.
    async fn dispatch(&self, event: &Event) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        match action_for(&event.type_) {
            SyncAction::SyncSubscription => self.sync_subscription(&mut tx, event).await?,
            SyncAction::RemoveSubscription => self.remove_subscription(&mut tx, event).await?,
            SyncAction::SyncInvoice => self.sync_invoice(&mut tx, event).await?,
            SyncAction::SyncCustomer => self.sync_customer(&mut tx, event).await?,
            SyncAction::TouchCustomer => self.touch_customer(&mut tx, event).await?,
            SyncAction::CompleteCheckout => self.complete_checkout(&mut tx, event).await?,
            SyncAction::Acknowledge => {
                tracing::debug!(event_type = %event.type_, "Acknowledged without side effects");
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn sync_subscription(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &Event,
    ) -> BillingResult<()> {
        let EventObject::Subscription(subscription) = &event.data.object else {
            return Err(unexpected_object(event));
        };

        let user_id = subscriptions::resolve_owner(&mut *tx, subscription).await?;
        subscriptions::upsert_subscription(&mut *tx, user_id, subscription).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            status = %subscriptions::subscription_status_str(subscription.status),
            "Subscription synced from webhook"
        );
        Ok(())
    }

    async fn remove_subscription(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &Event,
    ) -> BillingResult<()> {
        let EventObject::Subscription(subscription) = &event.data.object else {
            return Err(unexpected_object(event));
        };

        let canceled_at = subscription
            .canceled_at
            .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok())
            .unwrap_or_else(OffsetDateTime::now_utc);

        let existed =
            subscriptions::mark_canceled(&mut *tx, subscription.id.as_str(), canceled_at).await?;
        if !existed {
            // Deletion for a subscription we never saw. Nothing to remove,
            // and a re-fetch would 404, so acknowledge.
            tracing::warn!(
                subscription_id = %subscription.id,
                "Deletion event for unknown subscription"
            );
        }
        Ok(())
    }

    async fn sync_invoice(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &Event,
    ) -> BillingResult<()> {
        let EventObject::Invoice(invoice) = &event.data.object else {
            return Err(unexpected_object(event));
        };

        invoices::upsert_invoice(&mut *tx, invoice).await?;

        tracing::info!(
            invoice_id = %invoice.id,
            event_type = %event.type_,
            "Invoice synced from webhook"
        );
        Ok(())
    }

    async fn sync_customer(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &Event,
    ) -> BillingResult<()> {
        let EventObject::Customer(customer) = &event.data.object else {
            return Err(unexpected_object(event));
        };

        // Only customers we created carry the user_id metadata stamp.
        // Anything else in the Stripe account is not ours to project.
        let Some(user_id) = customers::user_id_from_metadata(customer.metadata.as_ref()) else {
            tracing::debug!(
                customer_id = %customer.id,
                "Customer event without user correlation, skipping"
            );
            return Ok(());
        };

        let Some(email) = customer.email.as_deref() else {
            tracing::debug!(customer_id = %customer.id, "Customer event without email, skipping");
            return Ok(());
        };

        customers::upsert_customer(
            &mut *tx,
            user_id,
            customer.id.as_str(),
            email,
            customer.name.as_deref(),
        )
        .await?;

        tracing::info!(
            user_id = %user_id,
            customer_id = %customer.id,
            "Customer synced from webhook"
        );
        Ok(())
    }

    async fn touch_customer(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &Event,
    ) -> BillingResult<()> {
        let EventObject::Customer(customer) = &event.data.object else {
            return Err(unexpected_object(event));
        };

        customers::touch_customer(&mut *tx, customer.id.as_str()).await?;
        tracing::info!(customer_id = %customer.id, "Customer deleted on provider side");
        Ok(())
    }

    async fn complete_checkout(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &Event,
    ) -> BillingResult<()> {
        let EventObject::CheckoutSession(session) = &event.data.object else {
            return Err(unexpected_object(event));
        };

        let subscription_id = match &session.subscription {
            Some(stripe::Expandable::Id(id)) => Some(id.to_string()),
            Some(stripe::Expandable::Object(sub)) => Some(sub.id.to_string()),
            None => None,
        };

        let tracked = checkout::mark_session_completed(
            &mut *tx,
            session.id.as_str(),
            subscription_id.as_deref(),
        )
        .await?;

        if tracked {
            tracing::info!(
                session_id = %session.id,
                subscription_id = ?subscription_id,
                "Checkout session completed"
            );
        } else {
            // Session not initiated through this service, nothing to track.
            tracing::debug!(session_id = %session.id, "Untracked checkout session completed");
        }
        Ok(())
    }
}

fn unexpected_object(event: &Event) -> BillingError {
    BillingError::MalformedPayload(format!(
        "event {} carried an unexpected object for type {}",
        event.id, event.type_
    ))
}
