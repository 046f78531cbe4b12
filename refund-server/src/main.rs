//! refund-server — administrative refund orchestrator
//!
//! Long-running service that:
//! - Quotes per-user refund exposure from top-up history and the refund ledger
//! - Executes refund batches across the aggregator and card channels with
//!   reserve/commit/compensate semantics per leg
//! - Runs a single-flight fleet-wide refund exposure estimate
//! - Serves a redacted public view of the refund audit log

mod api;
mod audit;
mod auth;
mod config;
mod db;
mod error;
mod estimate;
mod providers;
mod redact;
mod refund;
mod state;

use config::Config;
use state::AppState;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Load .env file
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "refund_server=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env();

    tracing::info!("Starting refund-server on port {}", config.port);

    let state = AppState::new(&config).await?;

    let app = api::create_router(state, &config);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("refund-server HTTP listening on {addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
