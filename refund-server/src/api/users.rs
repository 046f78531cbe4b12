//! User search endpoint

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use shared::error::AppError;

use crate::db::users;
use crate::error::ServiceResult;
use crate::state::AppState;

/// GET /api/users?q=<email or numeric id>
#[derive(Deserialize)]
pub struct UsersQuery {
    pub q: Option<String>,
    pub limit: Option<i32>,
}

pub async fn search_users(
    State(state): State<AppState>,
    Query(query): Query<UsersQuery>,
) -> ServiceResult<Json<Value>> {
    let q = query
        .q
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::validation("query parameter q is required"))?;

    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let items = users::search(&state.business, q, limit).await?;
    Ok(Json(json!({ "items": items })))
}
