//! Application state

use std::sync::Arc;

use sqlx::PgPool;

use draftly_billing::BillingCore;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub core: Arc<BillingCore>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let core = Arc::new(BillingCore::from_env(pool.clone()));
        tracing::info!("Billing reconciliation core initialized");

        Self { pool, config, core }
    }
}
