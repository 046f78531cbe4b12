//! Refund audit store (PostgreSQL)
//!
//! Append-mostly log of refund attempts. A row is inserted as `pending`
//! before the provider is called and settles to `succeeded` or `failed`
//! afterwards. `quota_delta` on a pending or succeeded row is the
//! authoritative amount already removed from the user's balance.

use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_SUCCEEDED: &str = "succeeded";
pub const STATUS_FAILED: &str = "failed";

pub const PROVIDER_AGGREGATOR: &str = "aggregator";
pub const PROVIDER_CARD: &str = "card";

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct RefundLogRow {
    pub id: Uuid,
    /// Unix milliseconds
    pub created_at: i64,
    pub mysql_user_id: i64,
    pub topup_trade_no: Option<String>,
    pub card_charge_id: Option<String>,
    pub card_payment_intent_id: Option<String>,
    pub payment_method: String,
    pub currency: String,
    /// Yuan string, two decimals
    pub refund_money: String,
    pub refund_money_minor: i64,
    pub quota_delta: i64,
    pub provider: String,
    pub out_refund_no: String,
    pub provider_refund_no: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
    pub performed_by: Option<String>,
    pub executed_at: Option<i64>,
    pub raw_request: Option<Value>,
    pub raw_response: Option<Value>,
}

/// Fields for a new pending row.
#[derive(Debug)]
pub struct NewRefundLog<'a> {
    pub mysql_user_id: i64,
    pub topup_trade_no: Option<&'a str>,
    pub card_charge_id: Option<&'a str>,
    pub card_payment_intent_id: Option<&'a str>,
    pub payment_method: &'a str,
    pub currency: &'a str,
    pub refund_money: &'a str,
    pub refund_money_minor: i64,
    pub quota_delta: i64,
    pub provider: &'a str,
    pub out_refund_no: &'a str,
    pub performed_by: Option<&'a str>,
    pub raw_request: &'a Value,
}

pub async fn insert_pending(pool: &PgPool, log: &NewRefundLog<'_>) -> Result<Uuid, sqlx::Error> {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO refund_logs (
            id, created_at, mysql_user_id, topup_trade_no, card_charge_id,
            card_payment_intent_id, payment_method, currency, refund_money,
            refund_money_minor, quota_delta, provider, out_refund_no, status,
            performed_by, raw_request
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
    )
    .bind(id)
    .bind(shared::util::now_millis())
    .bind(log.mysql_user_id)
    .bind(log.topup_trade_no)
    .bind(log.card_charge_id)
    .bind(log.card_payment_intent_id)
    .bind(log.payment_method)
    .bind(log.currency)
    .bind(log.refund_money)
    .bind(log.refund_money_minor)
    .bind(log.quota_delta)
    .bind(log.provider)
    .bind(log.out_refund_no)
    .bind(STATUS_PENDING)
    .bind(log.performed_by)
    .bind(log.raw_request)
    .execute(pool)
    .await?;
    Ok(id)
}

pub async fn mark_succeeded(
    pool: &PgPool,
    id: Uuid,
    provider_refund_no: Option<&str>,
    raw_response: &Value,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE refund_logs
         SET status = $1, provider_refund_no = $2, raw_response = $3, executed_at = $4
         WHERE id = $5",
    )
    .bind(STATUS_SUCCEEDED)
    .bind(provider_refund_no)
    .bind(raw_response)
    .bind(shared::util::now_millis())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_failed(
    pool: &PgPool,
    id: Uuid,
    error_message: &str,
    raw_response: Option<&Value>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE refund_logs
         SET status = $1, error_message = $2, raw_response = $3, executed_at = $4
         WHERE id = $5",
    )
    .bind(STATUS_FAILED)
    .bind(error_message)
    .bind(raw_response)
    .bind(shared::util::now_millis())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[derive(Debug, Default)]
pub struct RefundLogFilter<'a> {
    pub mysql_user_id: Option<i64>,
    pub status: Option<&'a str>,
    pub payment_method: Option<&'a str>,
    /// Unix milliseconds, inclusive
    pub start_at: Option<i64>,
    /// Unix milliseconds, exclusive
    pub end_at: Option<i64>,
    pub limit: i64,
    pub offset: i64,
}

pub async fn list(
    pool: &PgPool,
    filter: &RefundLogFilter<'_>,
) -> Result<Vec<RefundLogRow>, sqlx::Error> {
    let mut sql = String::from("SELECT * FROM refund_logs WHERE TRUE");
    let mut arg_index = 0u32;
    let mut next = |clause: &str, sql: &mut String| {
        arg_index += 1;
        sql.push_str(&clause.replace("{}", &format!("${arg_index}")));
    };

    if filter.mysql_user_id.is_some() {
        next(" AND mysql_user_id = {}", &mut sql);
    }
    if filter.status.is_some() {
        next(" AND status = {}", &mut sql);
    }
    if filter.payment_method.is_some() {
        next(" AND payment_method = {}", &mut sql);
    }
    if filter.start_at.is_some() {
        next(" AND created_at >= {}", &mut sql);
    }
    if filter.end_at.is_some() {
        next(" AND created_at < {}", &mut sql);
    }
    next(" ORDER BY created_at DESC LIMIT {}", &mut sql);
    next(" OFFSET {}", &mut sql);

    let mut query = sqlx::query_as::<_, RefundLogRow>(&sql);
    if let Some(uid) = filter.mysql_user_id {
        query = query.bind(uid);
    }
    if let Some(status) = filter.status {
        query = query.bind(status);
    }
    if let Some(method) = filter.payment_method {
        query = query.bind(method);
    }
    if let Some(start) = filter.start_at {
        query = query.bind(start);
    }
    if let Some(end) = filter.end_at {
        query = query.bind(end);
    }
    query = query.bind(filter.limit).bind(filter.offset);
    query.fetch_all(pool).await
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Option<RefundLogRow>, sqlx::Error> {
    sqlx::query_as::<_, RefundLogRow>("SELECT * FROM refund_logs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Lightweight history row for quote inputs: what has already been refunded
/// (or is being refunded right now) per payment target.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RefundHistoryRow {
    pub mysql_user_id: i64,
    pub topup_trade_no: Option<String>,
    pub card_charge_id: Option<String>,
    pub card_payment_intent_id: Option<String>,
    pub refund_money_minor: i64,
    pub quota_delta: i64,
}

const HISTORY_COLUMNS: &str = "mysql_user_id, topup_trade_no, card_charge_id, \
     card_payment_intent_id, refund_money_minor, quota_delta";

/// Pending and succeeded rows both count against balance.
pub async fn history_for_user(
    pool: &PgPool,
    mysql_user_id: i64,
) -> Result<Vec<RefundHistoryRow>, sqlx::Error> {
    let sql = format!(
        "SELECT {HISTORY_COLUMNS} FROM refund_logs
         WHERE mysql_user_id = $1 AND status IN ($2, $3)"
    );
    sqlx::query_as::<_, RefundHistoryRow>(&sql)
        .bind(mysql_user_id)
        .bind(STATUS_PENDING)
        .bind(STATUS_SUCCEEDED)
        .fetch_all(pool)
        .await
}

/// Whole-fleet history for the estimate job. Read-only.
pub async fn history_all(pool: &PgPool) -> Result<Vec<RefundHistoryRow>, sqlx::Error> {
    let sql = format!(
        "SELECT {HISTORY_COLUMNS} FROM refund_logs WHERE status IN ($1, $2)"
    );
    sqlx::query_as::<_, RefundHistoryRow>(&sql)
        .bind(STATUS_PENDING)
        .bind(STATUS_SUCCEEDED)
        .fetch_all(pool)
        .await
}
