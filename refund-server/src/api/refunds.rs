//! Refund audit log endpoints (admin view, unredacted)

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use shared::error::{AppError, ErrorKind};

use crate::audit;
use crate::error::ServiceResult;
use crate::state::AppState;

const MAX_LIMIT: i64 = 200;
const STATUSES: &[&str] = &[
    audit::STATUS_PENDING,
    audit::STATUS_SUCCEEDED,
    audit::STATUS_FAILED,
];

/// GET /api/refunds
#[derive(Deserialize)]
pub struct RefundsQuery {
    pub mysql_user_id: Option<i64>,
    pub status: Option<String>,
    pub payment_method: Option<String>,
    /// ISO-8601 timestamps
    pub start_at: Option<String>,
    pub end_at: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

fn parse_iso_millis(value: &str, field: &str) -> Result<i64, AppError> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| AppError::validation(format!("{field} must be an ISO-8601 timestamp")))
}

pub async fn list_refunds(
    State(state): State<AppState>,
    Query(query): Query<RefundsQuery>,
) -> ServiceResult<Json<Value>> {
    if let Some(status) = query.status.as_deref() {
        if !STATUSES.contains(&status) {
            return Err(AppError::validation(format!("unknown status: {status}")).into());
        }
    }

    let start_at = query
        .start_at
        .as_deref()
        .map(|s| parse_iso_millis(s, "start_at"))
        .transpose()?;
    let end_at = query
        .end_at
        .as_deref()
        .map(|s| parse_iso_millis(s, "end_at"))
        .transpose()?;

    let limit = query.limit.unwrap_or(50).clamp(1, MAX_LIMIT);
    let offset = query.offset.unwrap_or(0).max(0);

    let filter = audit::RefundLogFilter {
        mysql_user_id: query.mysql_user_id,
        status: query.status.as_deref(),
        payment_method: query.payment_method.as_deref().filter(|s| !s.is_empty()),
        start_at,
        end_at,
        limit,
        offset,
    };

    let items = audit::list(&state.audit, &filter).await?;
    Ok(Json(json!({
        "items": items,
        "limit": limit,
        "offset": offset,
    })))
}

/// GET /api/refunds/{id}
pub async fn get_refund(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ServiceResult<Json<audit::RefundLogRow>> {
    let id = Uuid::parse_str(&id)
        .map_err(|_| AppError::validation("refund id must be a UUID"))?;

    let row = audit::get(&state.audit, id)
        .await?
        .ok_or_else(|| AppError::not_found(ErrorKind::RefundNotFound, "refund"))?;
    Ok(Json(row))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_iso_millis() {
        assert_eq!(
            parse_iso_millis("1970-01-01T00:00:01Z", "start_at").unwrap(),
            1000
        );
        assert!(parse_iso_millis("2024-03-01T12:00:00+08:00", "start_at").is_ok());
        assert!(parse_iso_millis("yesterday", "start_at").is_err());
        assert!(parse_iso_millis("2024-03-01", "start_at").is_err());
    }
}
