//! Public activity view: redacted projection of the refund audit log
//!
//! Unauthenticated and therefore paranoid: every row passes through the
//! redaction walker, operator identity and internal error text never appear,
//! and responses are marked `cache-control: no-store`.

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use shared::error::{AppError, ErrorKind};

use crate::audit::{self, RefundLogRow};
use crate::error::ServiceResult;
use crate::redact::redact_value;
use crate::state::AppState;

const MAX_LIMIT: i64 = 100;

/// Internal-only fields stripped before redaction even sees the row.
const PRIVATE_FIELDS: &[&str] = &["error_message", "performed_by"];

fn project(row: &RefundLogRow, include_raw: bool) -> Value {
    let mut value = serde_json::to_value(row).unwrap_or_else(|_| json!({}));
    if let Some(map) = value.as_object_mut() {
        for field in PRIVATE_FIELDS {
            map.remove(*field);
        }
        if !include_raw {
            map.remove("raw_request");
            map.remove("raw_response");
        }
    }
    redact_value(&value)
}

fn no_store(body: Json<Value>) -> Response {
    ([(header::CACHE_CONTROL, "no-store")], body).into_response()
}

/// GET /api/public/refunds/activity
#[derive(Deserialize)]
pub struct ActivityQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_activity(
    State(state): State<AppState>,
    Query(query): Query<ActivityQuery>,
) -> ServiceResult<Response> {
    let limit = query.limit.unwrap_or(20).clamp(1, MAX_LIMIT);
    let offset = query.offset.unwrap_or(0).max(0);

    let rows = audit::list(
        &state.audit,
        &audit::RefundLogFilter {
            limit,
            offset,
            ..audit::RefundLogFilter::default()
        },
    )
    .await?;

    let items: Vec<Value> = rows.iter().map(|row| project(row, false)).collect();
    Ok(no_store(Json(json!({
        "items": items,
        "limit": limit,
        "offset": offset,
    }))))
}

/// GET /api/public/refunds/activity/{id}
pub async fn get_activity(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ServiceResult<Response> {
    let id = Uuid::parse_str(&id)
        .map_err(|_| AppError::validation("refund id must be a UUID"))?;

    let row = audit::get(&state.audit, id)
        .await?
        .ok_or_else(|| AppError::not_found(ErrorKind::RefundNotFound, "refund"))?;

    Ok(no_store(Json(project(&row, true))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row() -> RefundLogRow {
        RefundLogRow {
            id: Uuid::new_v4(),
            created_at: 1_700_000_000_000,
            mysql_user_id: 7,
            topup_trade_no: Some("T12345".into()),
            card_charge_id: Some("ch_AbC".into()),
            card_payment_intent_id: None,
            payment_method: "stripe".into(),
            currency: "cny".into(),
            refund_money: "9.50".into(),
            refund_money_minor: 950,
            quota_delta: 4_750_000,
            provider: "card".into(),
            out_refund_no: "card_userrefund_7_170_ch_AbC_950".into(),
            provider_refund_no: Some("re_999".into()),
            status: "succeeded".into(),
            error_message: Some("internal detail".into()),
            performed_by: Some("ops@example.com".into()),
            executed_at: Some(1_700_000_001_000),
            raw_request: Some(json!({"calc_trace": []})),
            raw_response: Some(json!({"id": "re_999", "charge": "ch_AbC"})),
        }
    }

    #[test]
    fn test_project_strips_private_fields() {
        let value = project(&sample_row(), false);
        assert!(value.get("error_message").is_none());
        assert!(value.get("performed_by").is_none());
        assert!(value.get("raw_request").is_none());
        assert!(value.get("raw_response").is_none());
    }

    #[test]
    fn test_project_redacts_identifiers() {
        let value = project(&sample_row(), true);
        assert_eq!(value["topup_trade_no"], "[redacted]");
        assert_eq!(value["card_charge_id"], "[redacted]");
        assert_eq!(value["out_refund_no"], "[redacted]");
        assert_eq!(value["provider_refund_no"], "[redacted]");
        // Raw blobs survive only in redacted form.
        assert_eq!(value["raw_response"]["charge"], "ch_[redacted]");
        // Money amounts are the whole point of the view.
        assert_eq!(value["refund_money"], "9.50");
        assert_eq!(value["status"], "succeeded");
    }
}
