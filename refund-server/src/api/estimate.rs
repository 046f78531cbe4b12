//! Fleet estimate endpoints

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ServiceResult;
use crate::estimate;
use crate::state::AppState;

/// GET /api/refund-estimate?autostart=1
#[derive(Deserialize)]
pub struct EstimateQuery {
    pub autostart: Option<String>,
}

pub async fn get_estimate(
    State(state): State<AppState>,
    Query(query): Query<EstimateQuery>,
) -> ServiceResult<Json<estimate::EstimateState>> {
    if query.autostart.as_deref() == Some("1") {
        estimate::try_start(state.clone()).await;
    }
    let snapshot = state.estimate.lock().await.clone();
    Ok(Json(snapshot))
}

/// POST /api/refund-estimate/recompute (no-op while one is running)
pub async fn recompute(State(state): State<AppState>) -> ServiceResult<Json<Value>> {
    let started = estimate::try_start(state.clone()).await;
    let snapshot = state.estimate.lock().await.clone();
    Ok(Json(json!({
        "started": started,
        "status": snapshot.status,
    })))
}

/// POST /api/refund-estimate/users
#[derive(Deserialize)]
pub struct EstimateUsersRequest {
    #[serde(default)]
    pub user_ids: Vec<Value>,
    pub user_ids_text: Option<String>,
}

pub async fn estimate_users(
    State(state): State<AppState>,
    Json(request): Json<EstimateUsersRequest>,
) -> ServiceResult<Json<estimate::UserEstimateResponse>> {
    let response = estimate::estimate_users(
        &state,
        &request.user_ids,
        request.user_ids_text.as_deref(),
    )
    .await?;
    Ok(Json(response))
}
