//! Application state for the refund server

use sqlx::{MySqlPool, PgPool};
use std::sync::Arc;

use crate::config::Config;
use crate::estimate::EstimateHandle;
use crate::providers::aggregator::AggregatorClient;
use crate::providers::card::CardClient;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Business database: users, top-ups, admin table (MySQL)
    pub business: MySqlPool,
    /// Refund audit store (PostgreSQL)
    pub audit: PgPool,
    /// Aggregator refund gateway (absent when not configured)
    pub aggregator: Option<Arc<AggregatorClient>>,
    /// Card processor client (absent when not configured)
    pub card: Option<Arc<CardClient>>,
    /// Fleet estimate job state (single writer = the running job)
    pub estimate: EstimateHandle,
    /// HS256 secret for admin JWT verification
    pub jwt_secret: String,
    /// Lowercased admin email allowlist
    pub admin_emails: Arc<Vec<String>>,
    /// Optional shared-secret bearer token
    pub admin_api_key: Option<String>,
}

impl AppState {
    /// Create a new AppState: connect both stores, run audit migrations,
    /// construct whichever provider adapters are configured.
    pub async fn new(config: &Config) -> Result<Self, BoxError> {
        let business = MySqlPool::connect(&config.business_database_url()).await?;
        let audit = PgPool::connect(&config.audit_database_url).await?;

        sqlx::migrate!("./migrations").run(&audit).await?;

        let aggregator = match AggregatorClient::from_config(config)? {
            Some(client) => Some(Arc::new(client)),
            None => {
                tracing::warn!(
                    "aggregator gateway not configured; aggregator refunds disabled. \
                     Set AGGREGATOR_BASE_URL, AGGREGATOR_PID, AGGREGATOR_PRIVATE_KEY to enable."
                );
                None
            }
        };

        let card = match &config.stripe_secret_key {
            Some(key) => Some(Arc::new(CardClient::new(key, &config.stripe_api_base))),
            None => {
                tracing::warn!(
                    "card processor not configured; card refunds disabled. \
                     Set STRIPE_SECRET_KEY to enable."
                );
                None
            }
        };

        Ok(Self {
            business,
            audit,
            aggregator,
            card,
            estimate: crate::estimate::new_handle(),
            jwt_secret: config.jwt_secret.clone(),
            admin_emails: Arc::new(config.admin_emails.clone()),
            admin_api_key: config.admin_api_key.clone(),
        })
    }
}
