use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::queries::{format_ts, insert_job, job_from_row, parse_ts};
use crate::models::dlq::DlqEntry;
use crate::models::job::{Job, JobState};

const DLQ_COLUMNS: &str = "id, command, moved_at, attempts, max_retries, reason, original_job";

fn dlq_entry_from_row(row: &SqliteRow) -> Result<DlqEntry, sqlx::Error> {
    let moved_at: String = row.try_get("moved_at")?;
    let original_job: String = row.try_get("original_job")?;

    Ok(DlqEntry {
        id: row.try_get("id")?,
        command: row.try_get("command")?,
        moved_at: parse_ts(&moved_at)?,
        attempts: row.try_get("attempts")?,
        max_retries: row.try_get("max_retries")?,
        reason: row.try_get("reason")?,
        original_job: serde_json::from_str(&original_job)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
    })
}

/// Snapshot a `failed` job into the DLQ and delete it, in one transaction.
///
/// The delete runs first so the transaction holds the write lock before it
/// reads anything. Returns `None` (and changes nothing) if the job is gone or
/// is no longer `failed`.
pub async fn move_to_dlq(
    pool: &SqlitePool,
    job_id: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<Option<DlqEntry>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query(
        r#"
        DELETE FROM jobs
        WHERE id = ?1 AND state = 'failed'
        RETURNING id, command, state, attempts, max_retries, created_at, updated_at, output, error,
                  lease_expires_at, retry_at
        "#,
    )
    .bind(job_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        tx.rollback().await?;
        return Ok(None);
    };

    let snapshot = Job {
        state: JobState::Dead,
        updated_at: now,
        lease_expires_at: None,
        retry_at: None,
        ..job_from_row(&row)?
    };
    let original_job =
        serde_json::to_string(&snapshot).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    sqlx::query(
        r#"
        INSERT INTO dlq_jobs (id, command, moved_at, attempts, max_retries, reason, original_job)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(&snapshot.id)
    .bind(&snapshot.command)
    .bind(format_ts(now))
    .bind(snapshot.attempts)
    .bind(snapshot.max_retries)
    .bind(reason)
    .bind(&original_job)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(Some(DlqEntry {
        id: snapshot.id.clone(),
        command: snapshot.command.clone(),
        moved_at: now,
        attempts: snapshot.attempts,
        max_retries: snapshot.max_retries,
        reason: reason.to_string(),
        original_job: snapshot,
    }))
}

/// Delete a DLQ entry and re-create it as a fresh pending job, in one transaction.
///
/// The new job keeps the id, command and retry ceiling; `attempts` starts at 0.
pub async fn take_for_retry(
    pool: &SqlitePool,
    job_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<Job>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query(
        r#"
        DELETE FROM dlq_jobs
        WHERE id = ?1
        RETURNING id, command, max_retries
        "#,
    )
    .bind(job_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        tx.rollback().await?;
        return Ok(None);
    };

    let command: String = row.try_get("command")?;
    let max_retries: u32 = row.try_get("max_retries")?;

    let job = insert_job(&mut *tx, job_id, &command, max_retries, now).await?;
    let Some(job) = job else {
        // unreachable while the delete above holds the row, but never commit half a retry
        tx.rollback().await?;
        return Ok(None);
    };

    tx.commit().await?;
    Ok(Some(job))
}

/// Get a DLQ entry by ID
pub async fn get_dlq_entry(pool: &SqlitePool, job_id: &str) -> Result<Option<DlqEntry>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {DLQ_COLUMNS} FROM dlq_jobs WHERE id = ?1"))
        .bind(job_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(dlq_entry_from_row).transpose()
}

/// All DLQ entries, most recently moved first
pub async fn list_dlq(pool: &SqlitePool) -> Result<Vec<DlqEntry>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {DLQ_COLUMNS} FROM dlq_jobs ORDER BY moved_at DESC, id ASC"
    ))
    .fetch_all(pool)
    .await?;

    rows.iter().map(dlq_entry_from_row).collect()
}

pub async fn count_dlq(pool: &SqlitePool) -> Result<u64, sqlx::Error> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dlq_jobs")
        .fetch_one(pool)
        .await?;
    Ok(count.max(0) as u64)
}
