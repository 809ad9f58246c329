// Billing crate clippy configuration
#![allow(clippy::field_reassign_with_default)] // Used for conditional struct field setting
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Parley Billing Module
//!
//! Stripe integration for subscriptions, invoicing, and the webhook
//! reconciliation pipeline.
//!
//! ## Features
//!
//! - **Webhooks**: Verified intake, durable idempotency gate, transactional
//!   entity synchronizers, replay for failed events
//! - **Subscriptions**: Checkout-based signup, cancellation, local projection
//! - **Invoices**: Local billing history projected from invoice events
//! - **Customers**: Lazy Stripe customer creation correlated to Parley users
//! - **Pull sync**: Checkout sessions reconciled from the client return flow
//!   and a worker sweep, independent of webhook delivery order

pub mod checkout;
pub mod client;
pub mod customers;
pub mod error;
pub mod event_store;
pub mod invoices;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Checkout
pub use checkout::{CheckoutResponse, CheckoutService, CheckoutSyncResult};

// Client
pub use client::{StripeClient, StripeConfig};

// Customers
pub use customers::CustomerService;

// Error
pub use error::{BillingError, BillingResult};

// Event store
pub use event_store::{EventStore, WebhookEventRecord};

// Invoices
pub use invoices::{InvoiceRecord, InvoiceService};

// Subscriptions
pub use subscriptions::{SubscriptionRecord, SubscriptionService};

// Webhooks
pub use webhooks::{WebhookHandler, WebhookOutcome};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub checkout: CheckoutService,
    pub customers: CustomerService,
    pub invoices: InvoiceService,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
    pub stripe: StripeClient,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        let stripe = StripeClient::new(config);

        Self {
            checkout: CheckoutService::new(stripe.clone(), pool.clone()),
            customers: CustomerService::new(stripe.clone(), pool.clone()),
            invoices: InvoiceService::new(stripe.clone(), pool.clone()),
            subscriptions: SubscriptionService::new(stripe.clone(), pool.clone()),
            webhooks: WebhookHandler::new(stripe.clone(), pool),
            stripe,
        }
    }
}
