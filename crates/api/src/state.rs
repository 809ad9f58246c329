//! Application state

use std::sync::Arc;

use parley_billing::BillingService;
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, billing: BillingService) -> Self {
        Self {
            pool,
            config,
            billing: Arc::new(billing),
        }
    }
}
