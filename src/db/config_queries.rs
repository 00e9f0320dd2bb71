use sqlx::{Row, SqlitePool};

use crate::config::ConfigKey;

/// Insert or replace a stored engine override
pub async fn set_value(pool: &SqlitePool, key: ConfigKey, value: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO config (key, value) VALUES (?1, ?2)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(key.as_ref())
    .bind(value)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_value(pool: &SqlitePool, key: ConfigKey) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar("SELECT value FROM config WHERE key = ?1")
        .bind(key.as_ref())
        .fetch_optional(pool)
        .await
}

/// Remove a stored override. Returns true if one existed.
pub async fn unset_value(pool: &SqlitePool, key: ConfigKey) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM config WHERE key = ?1")
        .bind(key.as_ref())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Every stored row, including keys this build no longer recognizes
pub async fn list_values(pool: &SqlitePool) -> Result<Vec<(String, String)>, sqlx::Error> {
    let rows = sqlx::query("SELECT key, value FROM config ORDER BY key")
        .fetch_all(pool)
        .await?;

    rows.into_iter()
        .map(|r| Ok((r.try_get("key")?, r.try_get("value")?)))
        .collect()
}
