//! Top-up endpoints: list with filters, detail with user joined

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use shared::error::{AppError, ErrorKind};

use crate::db::{topups, users};
use crate::error::ServiceResult;
use crate::state::AppState;

const MAX_LIMIT: i32 = 200;

/// GET /api/topups
#[derive(Deserialize)]
pub struct TopupsQuery {
    pub q: Option<String>,
    pub status: Option<String>,
    pub payment_method: Option<String>,
    pub limit: Option<i32>,
    pub offset: Option<i32>,
}

pub async fn list_topups(
    State(state): State<AppState>,
    Query(query): Query<TopupsQuery>,
) -> ServiceResult<Json<Value>> {
    let limit = query.limit.unwrap_or(50).clamp(1, MAX_LIMIT);
    let offset = query.offset.unwrap_or(0).max(0);

    let filter = topups::TopupFilter {
        q: query.q.as_deref().filter(|s| !s.is_empty()),
        status: query.status.as_deref().filter(|s| !s.is_empty()),
        payment_method: query.payment_method.as_deref().filter(|s| !s.is_empty()),
        limit,
        offset,
    };

    let items = topups::list(&state.business, &filter).await?;
    Ok(Json(json!({
        "items": items,
        "limit": limit,
        "offset": offset,
    })))
}

/// GET /api/topups/{trade_no}
pub async fn get_topup(
    State(state): State<AppState>,
    Path(trade_no): Path<String>,
) -> ServiceResult<Json<Value>> {
    let topup = topups::find_by_trade_no(&state.business, &trade_no)
        .await?
        .ok_or_else(|| AppError::not_found(ErrorKind::TopupNotFound, "top-up"))?;

    let user = users::find_by_id(&state.business, topup.user_id).await?;

    Ok(Json(json!({
        "topup": topup,
        "user": user,
    })))
}
