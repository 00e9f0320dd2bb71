use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteExecutor, SqlitePool};
use std::str::FromStr;

use crate::models::job::{FailureReport, Job, JobState};

const JOB_COLUMNS: &str = "id, command, state, attempts, max_retries, created_at, updated_at, \
     output, error, lease_expires_at, retry_at";

/// Fixed-width RFC 3339 so that lexical order in SQLite is chronological order.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn parse_optional_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    raw.as_deref().map(parse_ts).transpose()
}

pub(crate) fn job_from_row(row: &SqliteRow) -> Result<Job, sqlx::Error> {
    let state: String = row.try_get("state")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let lease_expires_at: Option<String> = row.try_get("lease_expires_at")?;
    let retry_at: Option<String> = row.try_get("retry_at")?;

    Ok(Job {
        id: row.try_get("id")?,
        command: row.try_get("command")?,
        state: JobState::from_str(&state).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        attempts: row.try_get("attempts")?,
        max_retries: row.try_get("max_retries")?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
        output: row.try_get("output")?,
        error: row.try_get("error")?,
        lease_expires_at: parse_optional_ts(lease_expires_at)?,
        retry_at: parse_optional_ts(retry_at)?,
    })
}

/// Insert a new pending job.
///
/// Returns `None` when the id is still held by a DLQ entry; a clash with a
/// live job surfaces as a unique-constraint violation.
pub async fn insert_job<'e, E: SqliteExecutor<'e>>(
    executor: E,
    id: &str,
    command: &str,
    max_retries: u32,
    now: DateTime<Utc>,
) -> Result<Option<Job>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO jobs (id, command, state, attempts, max_retries, created_at, updated_at)
        SELECT ?1, ?2, 'pending', 0, ?3, ?4, ?4
        WHERE NOT EXISTS (SELECT 1 FROM dlq_jobs WHERE id = ?1)
        RETURNING id, command, state, attempts, max_retries, created_at, updated_at, output, error,
                  lease_expires_at, retry_at
        "#,
    )
    .bind(id)
    .bind(command)
    .bind(max_retries)
    .bind(format_ts(now))
    .fetch_optional(executor)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Get a job by ID
pub async fn get_job(pool: &SqlitePool, job_id: &str) -> Result<Option<Job>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
        .bind(job_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Atomically move the oldest pending job to `processing` and return it.
///
/// Selection and transition happen in one statement, and the outer
/// `state = 'pending'` guard makes it a compare-and-swap: a row that another
/// connection claimed first is simply not updated. The claimer's own lease
/// deadline is stored on the row, so the sweep never judges a claim by some
/// other process's timeout.
pub async fn claim_next(
    pool: &SqlitePool,
    now: DateTime<Utc>,
    lease_expires_at: DateTime<Utc>,
) -> Result<Option<Job>, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        UPDATE jobs
        SET state = 'processing',
            updated_at = ?1,
            lease_expires_at = ?2,
            retry_at = NULL
        WHERE id = (
            SELECT id FROM jobs
            WHERE state = 'pending'
            ORDER BY created_at ASC, id ASC
            LIMIT 1
        )
        AND state = 'pending'
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(format_ts(now))
    .bind(format_ts(lease_expires_at))
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// `processing -> completed`. Returns `None` if the job was not in `processing`.
pub async fn mark_completed(
    pool: &SqlitePool,
    job_id: &str,
    output: &str,
    now: DateTime<Utc>,
) -> Result<Option<Job>, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        UPDATE jobs
        SET state = 'completed',
            output = ?1,
            error = NULL,
            updated_at = ?2,
            lease_expires_at = NULL
        WHERE id = ?3 AND state = 'processing'
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(output)
    .bind(format_ts(now))
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// `processing -> failed`, bumping `attempts` and recording the error.
///
/// `retry_at` is when the reporting worker intends to requeue the job.
pub async fn record_failure(
    pool: &SqlitePool,
    job_id: &str,
    output: Option<&str>,
    error: &str,
    now: DateTime<Utc>,
    retry_at: DateTime<Utc>,
) -> Result<Option<FailureReport>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        UPDATE jobs
        SET state = 'failed',
            attempts = attempts + 1,
            output = ?1,
            error = ?2,
            updated_at = ?3,
            lease_expires_at = NULL,
            retry_at = ?4
        WHERE id = ?5 AND state = 'processing'
        RETURNING attempts, max_retries
        "#,
    )
    .bind(output)
    .bind(error)
    .bind(format_ts(now))
    .bind(format_ts(retry_at))
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.map(|r| {
        Ok(FailureReport {
            attempts: r.try_get("attempts")?,
            max_retries: r.try_get("max_retries")?,
        })
    })
    .transpose()
}

/// `failed -> pending` for the failure that left `attempts` at the given count.
///
/// Returns false if the job is not `failed` or has failed again since, so a
/// stale caller cannot release a later attempt early.
pub async fn requeue(
    pool: &SqlitePool,
    job_id: &str,
    attempts: u32,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET state = 'pending',
            updated_at = ?1,
            retry_at = NULL
        WHERE id = ?2 AND state = 'failed' AND attempts = ?3
        "#,
    )
    .bind(format_ts(now))
    .bind(job_id)
    .bind(attempts)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Job counts grouped by state
pub async fn count_by_state(pool: &SqlitePool) -> Result<Vec<(JobState, u64)>, sqlx::Error> {
    let rows = sqlx::query("SELECT state, COUNT(*) AS count FROM jobs GROUP BY state")
        .fetch_all(pool)
        .await?;

    rows.into_iter()
        .map(|r| {
            let state: String = r.try_get("state")?;
            let count: i64 = r.try_get("count")?;
            let state =
                JobState::from_str(&state).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
            Ok((state, count.max(0) as u64))
        })
        .collect()
}

/// Jobs in one state, newest first
pub async fn list_by_state(pool: &SqlitePool, state: JobState) -> Result<Vec<Job>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM jobs
        WHERE state = ?1
        ORDER BY created_at DESC, id DESC
        "#
    ))
    .bind(state.as_ref())
    .fetch_all(pool)
    .await?;

    rows.iter().map(job_from_row).collect()
}

/// Fail every `processing` job whose lease deadline has passed.
///
/// Each abandoned attempt counts against the retry budget, exactly as a
/// reported failure would.
pub async fn expire_leases(pool: &SqlitePool, now: DateTime<Utc>) -> Result<Vec<Job>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        r#"
        UPDATE jobs
        SET state = 'failed',
            attempts = attempts + 1,
            error = 'Lease expired: no outcome reported by ' || lease_expires_at,
            updated_at = ?1,
            lease_expires_at = NULL,
            retry_at = ?1
        WHERE state = 'processing' AND lease_expires_at < ?1
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(format_ts(now))
    .fetch_all(pool)
    .await?;

    rows.iter().map(job_from_row).collect()
}

/// `failed` jobs whose scheduled release (or last update, if none was
/// scheduled) is older than `cutoff`
pub async fn stale_failed(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<Vec<Job>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM jobs
        WHERE state = 'failed' AND COALESCE(retry_at, updated_at) < ?1
        ORDER BY updated_at ASC
        "#
    ))
    .bind(format_ts(cutoff))
    .fetch_all(pool)
    .await?;

    rows.iter().map(job_from_row).collect()
}
