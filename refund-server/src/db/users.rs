//! User queries and the conditional quota reserve/release primitives

use sqlx::MySqlPool;

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct UserRow {
    pub id: i64,
    pub email: Option<String>,
    pub card_customer_id: Option<String>,
    pub quota: i64,
    pub used_quota: i64,
}

pub async fn find_by_id(pool: &MySqlPool, id: i64) -> Result<Option<UserRow>, sqlx::Error> {
    sqlx::query_as::<_, UserRow>(
        "SELECT id, email, card_customer_id, quota, used_quota FROM users WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Search by exact numeric id or email substring.
pub async fn search(
    pool: &MySqlPool,
    q: &str,
    limit: i32,
) -> Result<Vec<UserRow>, sqlx::Error> {
    if let Ok(id) = q.parse::<i64>() {
        let row = find_by_id(pool, id).await?;
        return Ok(row.into_iter().collect());
    }
    sqlx::query_as::<_, UserRow>(
        "SELECT id, email, card_customer_id, quota, used_quota
         FROM users WHERE email LIKE ? ORDER BY id LIMIT ?",
    )
    .bind(format!("%{q}%"))
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// All users, for the fleet estimate. Read-only.
pub async fn list_all(pool: &MySqlPool) -> Result<Vec<UserRow>, sqlx::Error> {
    sqlx::query_as::<_, UserRow>(
        "SELECT id, email, card_customer_id, quota, used_quota FROM users ORDER BY id",
    )
    .fetch_all(pool)
    .await
}

pub async fn find_by_ids(pool: &MySqlPool, ids: &[i64]) -> Result<Vec<UserRow>, sqlx::Error> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; ids.len()].join(",");
    let sql = format!(
        "SELECT id, email, card_customer_id, quota, used_quota FROM users WHERE id IN ({placeholders})"
    );
    let mut query = sqlx::query_as::<_, UserRow>(&sql);
    for id in ids {
        query = query.bind(id);
    }
    query.fetch_all(pool).await
}

/// Reserve quota for a refund leg: conditional decrement.
///
/// The `quota >= ?` predicate plus the affected-row check is the concurrency
/// primitive; no row locks. Returns false when the balance no longer covers
/// the delta.
pub async fn reserve_quota(
    pool: &MySqlPool,
    user_id: i64,
    delta: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE users SET quota = quota - ? WHERE id = ? AND quota >= ?")
        .bind(delta)
        .bind(user_id)
        .bind(delta)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Compensating release after a failed provider leg.
pub async fn release_quota(
    pool: &MySqlPool,
    user_id: i64,
    delta: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET quota = quota + ? WHERE id = ?")
        .bind(delta)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}
