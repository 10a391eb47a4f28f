use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use sqlx::PgPool;

use crate::{
    config::{AppConfig, AutopaySettings},
    db::create_pool,
    error::AppError,
    repository::{pg_store::PgStore, LeaseStore, LedgerStore, PaymentProfileStore},
    services::{
        gateway::PaymentGateway,
        notifications::{AutomationWebhook, BillingEventSink, PgEventSink},
        stripe_gateway::StripeGateway,
    },
    tenancy::RoleResolver,
};

/// Everything the billing core needs, behind trait objects so tests can swap
/// in memory stores and a scripted gateway.
pub struct BillingContext {
    pub leases: Arc<dyn LeaseStore>,
    pub ledger: Arc<dyn LedgerStore>,
    pub profiles: Arc<dyn PaymentProfileStore>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub events: Arc<dyn BillingEventSink>,
    pub roles: RoleResolver,
    pub settings: AutopaySettings,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db_pool: Option<PgPool>,
    pub http_client: Client,
    pub billing: Option<Arc<BillingContext>>,
}

impl AppState {
    pub fn build(config: AppConfig) -> Result<Self, AppError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.stripe_timeout_seconds.max(1) + 5))
            .build()
            .map_err(|error| AppError::Internal(format!("HTTP client init failed: {error}")))?;

        let db_pool = create_pool(&config)?;
        let billing = match &db_pool {
            Some(pool) => {
                let store = Arc::new(PgStore::new(pool.clone()));
                let gateway = Arc::new(StripeGateway::from_config(http_client.clone(), &config)?);
                let automation = AutomationWebhook::from_config(http_client.clone(), &config);
                let events = Arc::new(PgEventSink::new(pool.clone(), automation));
                let roles = RoleResolver::new(
                    store.clone(),
                    config.autopay.admin_roles.clone(),
                    config.org_membership_cache_ttl_seconds,
                    config.org_membership_cache_max_entries,
                );
                Some(Arc::new(BillingContext {
                    leases: store.clone(),
                    ledger: store.clone(),
                    profiles: store,
                    gateway,
                    events,
                    roles,
                    settings: config.autopay.clone(),
                }))
            }
            None => {
                tracing::warn!("No database configured; billing endpoints will return 503");
                None
            }
        };

        Ok(Self {
            config: Arc::new(config),
            db_pool,
            http_client,
            billing,
        })
    }

    pub fn billing(&self) -> Result<&BillingContext, AppError> {
        self.billing.as_deref().ok_or_else(|| {
            AppError::Dependency(
                "Supabase database is not configured. Set SUPABASE_DB_URL or DATABASE_URL."
                    .to_string(),
            )
        })
    }
}
