//! API routes for the refund server

pub mod estimate;
pub mod health;
pub mod public;
pub mod refund;
pub mod refunds;
pub mod topups;
pub mod users;

use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::{middleware, Router};
use tower_http::cors::CorsLayer;

use crate::auth::admin_auth_middleware;
use crate::config::Config;
use crate::state::AppState;

/// Create the combined router
pub fn create_router(state: AppState, config: &Config) -> Router {
    // Administrator API (bearer authenticated)
    let admin = Router::new()
        .route("/api/topups", get(topups::list_topups))
        .route("/api/topups/{trade_no}", get(topups::get_topup))
        .route("/api/users", get(users::search_users))
        .route("/api/users/{uid}/refund-quote", get(refund::get_refund_quote))
        .route("/api/users/{uid}/refund", post(refund::execute_refund))
        .route("/api/refunds", get(refunds::list_refunds))
        .route("/api/refunds/{id}", get(refunds::get_refund))
        .route("/api/refund-estimate", get(estimate::get_estimate))
        .route("/api/refund-estimate/recompute", post(estimate::recompute))
        .route("/api/refund-estimate/users", post(estimate::estimate_users))
        .route("/api/refund", post(refund::refund_single_topup))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ));

    // Public activity view (redacted, unauthenticated)
    let public = Router::new()
        .route("/api/public/refunds/activity", get(public::list_activity))
        .route(
            "/api/public/refunds/activity/{id}",
            get(public::get_activity),
        );

    let mut router = Router::new()
        .route("/health", get(health::health_check))
        .merge(admin)
        .merge(public)
        .with_state(state);

    if let Some(origin) = &config.admin_cors_origin {
        match origin.parse::<HeaderValue>() {
            Ok(origin) => {
                router = router.layer(
                    CorsLayer::new()
                        .allow_origin(origin)
                        .allow_methods(tower_http::cors::Any)
                        .allow_headers(tower_http::cors::Any),
                );
            }
            Err(_) => {
                tracing::warn!(origin = %origin, "invalid ADMIN_CORS_ORIGIN, CORS disabled");
            }
        }
    }

    router
}
