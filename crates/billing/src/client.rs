//! Stripe client wrapper
//!
//! Thin adapter over the async-stripe SDK. All provider reads and writes the
//! billing subsystem performs go through this type, so the rest of the code
//! never touches raw API credentials or ID parsing.

use std::sync::Arc;

use stripe::{
    CancelSubscription, CheckoutSession, CheckoutSessionId, Invoice, InvoiceId, ListPrices, Price,
    Subscription, SubscriptionId, UpdateSubscription,
};

use crate::error::{BillingError, BillingResult};

/// Stripe configuration, resolved once at startup from the environment and
/// injected into every service that needs it.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// The Stripe product whose prices are offered as subscription plans.
    pub product_id: String,
    pub checkout_success_url: String,
    pub checkout_cancel_url: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        fn required(name: &str) -> BillingResult<String> {
            std::env::var(name).map_err(|_| BillingError::Internal(format!("{} not set", name)))
        }

        Ok(Self {
            secret_key: required("STRIPE_SECRET_KEY")?,
            webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
            product_id: required("STRIPE_PRODUCT_ID")?,
            checkout_success_url: required("CHECKOUT_SUCCESS_URL")?,
            checkout_cancel_url: required("CHECKOUT_CANCEL_URL")?,
        })
    }
}

/// Shared Stripe client handle.
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self {
            inner,
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Fetch the authoritative subscription record from Stripe.
    pub async fn retrieve_subscription(&self, id: &str) -> BillingResult<Subscription> {
        let sub_id: SubscriptionId = id
            .parse()
            .map_err(|_| BillingError::Internal(format!("invalid subscription id: {}", id)))?;
        Ok(Subscription::retrieve(&self.inner, &sub_id, &[]).await?)
    }

    /// Fetch the authoritative invoice record from Stripe.
    pub async fn retrieve_invoice(&self, id: &str) -> BillingResult<Invoice> {
        let invoice_id: InvoiceId = id
            .parse()
            .map_err(|_| BillingError::Internal(format!("invalid invoice id: {}", id)))?;
        Ok(Invoice::retrieve(&self.inner, &invoice_id, &[]).await?)
    }

    /// Fetch a checkout session, used by the pull-based sync fallback.
    pub async fn retrieve_checkout_session(&self, id: &str) -> BillingResult<CheckoutSession> {
        let session_id: CheckoutSessionId = id
            .parse()
            .map_err(|_| BillingError::Internal(format!("invalid checkout session id: {}", id)))?;
        Ok(CheckoutSession::retrieve(&self.inner, &session_id, &[]).await?)
    }

    /// List active prices for the configured product.
    pub async fn list_prices_for_product(&self) -> BillingResult<Vec<Price>> {
        let mut params = ListPrices::default();
        params.product = Some(stripe::IdOrCreate::Id(&self.config.product_id));
        params.active = Some(true);

        let prices = Price::list(&self.inner, &params).await?;
        Ok(prices.data)
    }

    /// Cancel a subscription immediately.
    pub async fn cancel_subscription(&self, id: &str) -> BillingResult<Subscription> {
        let sub_id: SubscriptionId = id
            .parse()
            .map_err(|_| BillingError::Internal(format!("invalid subscription id: {}", id)))?;
        Ok(Subscription::cancel(&self.inner, &sub_id, CancelSubscription::default()).await?)
    }

    /// Flag a subscription to cancel when the current period ends.
    pub async fn cancel_subscription_at_period_end(&self, id: &str) -> BillingResult<Subscription> {
        let sub_id: SubscriptionId = id
            .parse()
            .map_err(|_| BillingError::Internal(format!("invalid subscription id: {}", id)))?;

        let params = UpdateSubscription {
            cancel_at_period_end: Some(true),
            ..Default::default()
        };
        Ok(Subscription::update(&self.inner, &sub_id, params).await?)
    }
}
