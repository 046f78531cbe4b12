//! Admin table lookup for JWT subjects

use sqlx::MySqlPool;

/// True when the JWT subject is registered in the admin table.
pub async fn is_admin_subject(pool: &MySqlPool, subject: &str) -> Result<bool, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM admin_users WHERE subject = ?")
        .bind(subject)
        .fetch_one(pool)
        .await?;
    Ok(count > 0)
}
