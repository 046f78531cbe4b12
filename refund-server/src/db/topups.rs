//! Top-up queries
//!
//! `money` and `amount` are stored as yuan strings with two decimals;
//! conversion to cents/quota happens in the quote builder, never in SQL.

use sqlx::MySqlPool;

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_REFUND: &str = "refund";

pub const METHOD_ALIPAY: &str = "alipay";
pub const METHOD_WXPAY: &str = "wxpay";
pub const METHOD_STRIPE: &str = "stripe";

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct TopupRow {
    pub id: i64,
    pub user_id: i64,
    /// Paid amount in yuan. Authoritative for aggregator payments only.
    pub money: String,
    /// Granted quota expressed in yuan-equivalent; convertible by × 500000.
    pub amount: Option<String>,
    /// External id: aggregator trade no, or card charge / payment-intent id.
    pub trade_no: String,
    pub create_time: i64,
    pub complete_time: Option<i64>,
    pub payment_method: String,
    pub status: String,
}

impl TopupRow {
    pub fn is_aggregator(&self) -> bool {
        matches!(self.payment_method.as_str(), METHOD_ALIPAY | METHOD_WXPAY)
    }
}

#[derive(Debug, Default)]
pub struct TopupFilter<'a> {
    /// Substring match on trade_no, or exact user id when numeric
    pub q: Option<&'a str>,
    pub status: Option<&'a str>,
    pub payment_method: Option<&'a str>,
    pub limit: i32,
    pub offset: i32,
}

pub async fn list(pool: &MySqlPool, filter: &TopupFilter<'_>) -> Result<Vec<TopupRow>, sqlx::Error> {
    let mut sql = String::from(
        "SELECT id, user_id, money, amount, trade_no, create_time, complete_time, payment_method, status
         FROM topups WHERE 1=1",
    );
    let mut user_id_bind: Option<i64> = None;
    let mut trade_no_bind: Option<String> = None;

    if let Some(q) = filter.q {
        if let Ok(user_id) = q.parse::<i64>() {
            sql.push_str(" AND (user_id = ? OR trade_no LIKE ?)");
            user_id_bind = Some(user_id);
        } else {
            sql.push_str(" AND trade_no LIKE ?");
        }
        trade_no_bind = Some(format!("%{q}%"));
    }
    if filter.status.is_some() {
        sql.push_str(" AND status = ?");
    }
    if filter.payment_method.is_some() {
        sql.push_str(" AND payment_method = ?");
    }
    sql.push_str(" ORDER BY create_time DESC LIMIT ? OFFSET ?");

    let mut query = sqlx::query_as::<_, TopupRow>(&sql);
    if let Some(user_id) = user_id_bind {
        query = query.bind(user_id);
    }
    if let Some(trade_no) = trade_no_bind {
        query = query.bind(trade_no);
    }
    if let Some(status) = filter.status {
        query = query.bind(status);
    }
    if let Some(method) = filter.payment_method {
        query = query.bind(method);
    }
    query = query.bind(filter.limit).bind(filter.offset);
    query.fetch_all(pool).await
}

pub async fn find_by_trade_no(
    pool: &MySqlPool,
    trade_no: &str,
) -> Result<Option<TopupRow>, sqlx::Error> {
    sqlx::query_as::<_, TopupRow>(
        "SELECT id, user_id, money, amount, trade_no, create_time, complete_time, payment_method, status
         FROM topups WHERE trade_no = ?",
    )
    .bind(trade_no)
    .fetch_optional(pool)
    .await
}

/// All top-ups for one user, newest first.
pub async fn list_for_user(pool: &MySqlPool, user_id: i64) -> Result<Vec<TopupRow>, sqlx::Error> {
    sqlx::query_as::<_, TopupRow>(
        "SELECT id, user_id, money, amount, trade_no, create_time, complete_time, payment_method, status
         FROM topups WHERE user_id = ? ORDER BY create_time DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
}

/// Every top-up in the system, for the fleet estimate. Read-only.
pub async fn list_all(pool: &MySqlPool) -> Result<Vec<TopupRow>, sqlx::Error> {
    sqlx::query_as::<_, TopupRow>(
        "SELECT id, user_id, money, amount, trade_no, create_time, complete_time, payment_method, status
         FROM topups ORDER BY user_id, create_time",
    )
    .fetch_all(pool)
    .await
}

/// Lock one top-up row for the single-top-up refund path.
pub async fn find_by_trade_no_for_update(
    tx: &mut sqlx::Transaction<'_, sqlx::MySql>,
    trade_no: &str,
) -> Result<Option<TopupRow>, sqlx::Error> {
    sqlx::query_as::<_, TopupRow>(
        "SELECT id, user_id, money, amount, trade_no, create_time, complete_time, payment_method, status
         FROM topups WHERE trade_no = ? FOR UPDATE",
    )
    .bind(trade_no)
    .fetch_optional(&mut **tx)
    .await
}

/// Flip success → refund. The status predicate guards against a concurrent
/// full refund of the same top-up.
pub async fn mark_refunded(
    tx: &mut sqlx::Transaction<'_, sqlx::MySql>,
    topup_id: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE topups SET status = ? WHERE id = ? AND status = ?")
        .bind(STATUS_REFUND)
        .bind(topup_id)
        .bind(STATUS_SUCCESS)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Decrement the user's quota inside the single-top-up transaction.
pub async fn decrement_quota_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::MySql>,
    user_id: i64,
    delta: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET quota = quota - ? WHERE id = ?")
        .bind(delta)
        .bind(user_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}
