use chrono::Utc;
use sqlx::SqlitePool;
use std::time::Duration;
use strum::IntoEnumIterator;
use uuid::Uuid;

use crate::config::{settings, ConfigError, ConfigKey, EngineSettings};
use crate::db::{config_queries, dlq_queries, queries};
use crate::models::dlq::DlqEntry;
use crate::models::job::{FailureReport, Job, JobState, QueueSummary};
use crate::models::submission::{NewJob, SubmissionError};

/// SQLite-backed durable job store.
///
/// Every transition is a single guarded statement or a single-job
/// transaction, so any number of workers (tasks or processes) can share it.
#[derive(Debug, Clone)]
pub struct JobQueue {
    pool: SqlitePool,
}

impl JobQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `database_url` and migrate it.
    pub async fn connect(database_url: &str) -> Result<Self, QueueError> {
        let pool = crate::db::init_pool(database_url).await?;
        crate::db::run_migrations(&pool)
            .await
            .map_err(QueueError::Migration)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Enqueue a command under a freshly generated id.
    pub async fn submit(&self, command: &str, max_retries: u32) -> Result<String, QueueError> {
        let id = Uuid::new_v4().to_string();
        self.submit_with_id(&id, command, max_retries).await?;
        Ok(id)
    }

    /// Enqueue a command under a caller-chosen id.
    ///
    /// The id must be unused by both live jobs and DLQ entries.
    pub async fn submit_with_id(
        &self,
        id: &str,
        command: &str,
        max_retries: u32,
    ) -> Result<Job, QueueError> {
        if command.trim().is_empty() {
            return Err(QueueError::Validation(SubmissionError::MissingCommand.to_string()));
        }

        let inserted = queries::insert_job(&self.pool, id, command, max_retries, Utc::now())
            .await
            .map_err(|e| duplicate_or_storage(e, id))?;

        let job = inserted.ok_or_else(|| QueueError::DuplicateId(id.to_string()))?;
        metrics::counter!("queue_jobs_submitted_total").increment(1);
        tracing::info!(job_id = %job.id, max_retries, "Job enqueued");
        Ok(job)
    }

    /// Enqueue a validated submission, falling back to `default_max_retries`.
    pub async fn submit_new(&self, job: NewJob, default_max_retries: u32) -> Result<Job, QueueError> {
        let max_retries = job.max_retries.unwrap_or(default_max_retries);
        let id = job.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.submit_with_id(&id, &job.command, max_retries).await
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>, QueueError> {
        Ok(queries::get_job(&self.pool, id).await?)
    }

    /// Claim the oldest pending job for exclusive execution.
    ///
    /// The claim is held for `lease`; past that the sweep may treat the
    /// attempt as abandoned.
    pub async fn claim_next(&self, lease: Duration) -> Result<Option<Job>, QueueError> {
        let now = Utc::now();
        let expires = now + chrono_duration(lease);
        Ok(queries::claim_next(&self.pool, now, expires).await?)
    }

    /// Returns false if the job was no longer `processing`.
    pub async fn report_success(&self, id: &str, output: &str) -> Result<bool, QueueError> {
        let updated = queries::mark_completed(&self.pool, id, output, Utc::now()).await?;
        Ok(updated.is_some())
    }

    /// Count a failed attempt. The caller decides between requeue and DLQ.
    ///
    /// `retry_after` is the backoff the caller will wait before `requeue`;
    /// the sweep leaves the job alone until that has passed.
    /// Returns `None` if the job was no longer `processing` (e.g. its lease
    /// was already expired by the sweep).
    pub async fn report_failure(
        &self,
        id: &str,
        error: &str,
        output: Option<&str>,
        retry_after: Duration,
    ) -> Result<Option<FailureReport>, QueueError> {
        let now = Utc::now();
        let retry_at = now + chrono_duration(retry_after);
        Ok(queries::record_failure(&self.pool, id, output, error, now, retry_at).await?)
    }

    /// Release a `failed` job back to `pending`.
    ///
    /// `attempts` is the count returned by the failure being released; a job
    /// that has since been requeued and failed again is left untouched.
    pub async fn requeue(&self, id: &str, attempts: u32) -> Result<bool, QueueError> {
        Ok(queries::requeue(&self.pool, id, attempts, Utc::now()).await?)
    }

    /// Dead-letter a `failed` job. Returns `None` if the job no longer exists
    /// or has left `failed` (so a retried or reclaimed job is never lost).
    pub async fn move_to_dlq(&self, id: &str, reason: &str) -> Result<Option<DlqEntry>, QueueError> {
        let entry = dlq_queries::move_to_dlq(&self.pool, id, reason, Utc::now()).await?;
        if entry.is_some() {
            metrics::counter!("queue_jobs_dead_lettered_total").increment(1);
        }
        Ok(entry)
    }

    /// Replay a DLQ entry as a fresh pending job. Returns false if there is no such entry.
    pub async fn retry_from_dlq(&self, id: &str) -> Result<bool, QueueError> {
        let job = dlq_queries::take_for_retry(&self.pool, id, Utc::now())
            .await
            .map_err(|e| duplicate_or_storage(e, id))?;
        if job.is_some() {
            tracing::info!(job_id = %id, "DLQ entry moved back to queue");
        }
        Ok(job.is_some())
    }

    pub async fn get_dlq_entry(&self, id: &str) -> Result<Option<DlqEntry>, QueueError> {
        Ok(dlq_queries::get_dlq_entry(&self.pool, id).await?)
    }

    pub async fn list_dlq(&self) -> Result<Vec<DlqEntry>, QueueError> {
        Ok(dlq_queries::list_dlq(&self.pool).await?)
    }

    pub async fn list_by_state(&self, state: JobState) -> Result<Vec<Job>, QueueError> {
        Ok(queries::list_by_state(&self.pool, state).await?)
    }

    /// Counts for every live state (zero-filled) plus the DLQ size.
    pub async fn summary(&self) -> Result<QueueSummary, QueueError> {
        let mut summary = QueueSummary::default();
        for state in JobState::iter().filter(|s| *s != JobState::Dead) {
            summary.states.insert(state, 0);
        }
        for (state, count) in queries::count_by_state(&self.pool).await? {
            summary.states.insert(state, count);
        }
        summary.dlq = dlq_queries::count_dlq(&self.pool).await?;
        Ok(summary)
    }

    /// Fail every `processing` job whose claimer's lease has run out.
    pub async fn expire_leases(&self) -> Result<Vec<Job>, QueueError> {
        let expired = queries::expire_leases(&self.pool, Utc::now()).await?;
        if !expired.is_empty() {
            metrics::counter!("queue_leases_expired_total").increment(expired.len() as u64);
        }
        Ok(expired)
    }

    /// `failed` jobs still not requeued `age` after their scheduled release.
    pub async fn stale_failed(&self, age: Duration) -> Result<Vec<Job>, QueueError> {
        let cutoff = Utc::now() - chrono_duration(age);
        Ok(queries::stale_failed(&self.pool, cutoff).await?)
    }

    /// Environment-derived settings overlaid with the stored overrides.
    pub async fn engine_settings(&self, base: EngineSettings) -> Result<EngineSettings, QueueError> {
        let rows = config_queries::list_values(&self.pool).await?;
        Ok(base.with_overrides(rows))
    }

    /// Validate and persist an engine override.
    pub async fn set_config(&self, key: &str, value: &str) -> Result<ConfigKey, QueueError> {
        let key = ConfigKey::parse(key)?;
        settings::validate_value(key, value)?;
        config_queries::set_value(&self.pool, key, value.trim()).await?;
        Ok(key)
    }

    pub async fn get_config(&self, key: &str) -> Result<Option<String>, QueueError> {
        let key = ConfigKey::parse(key)?;
        Ok(config_queries::get_value(&self.pool, key).await?)
    }

    pub async fn unset_config(&self, key: &str) -> Result<bool, QueueError> {
        let key = ConfigKey::parse(key)?;
        Ok(config_queries::unset_value(&self.pool, key).await?)
    }

    /// Check database connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn duplicate_or_storage(err: sqlx::Error, id: &str) -> QueueError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            QueueError::DuplicateId(id.to_string())
        }
        _ => QueueError::StorageUnavailable(err),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("{0}")]
    Validation(String),

    #[error("Job id '{0}' already exists")]
    DuplicateId(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(sqlx::Error),
}

impl QueueError {
    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            QueueError::Validation(_) => "validation_error",
            QueueError::DuplicateId(_) => "duplicate_id",
            QueueError::StorageUnavailable(_) | QueueError::Migration(_) => "storage_unavailable",
        }
    }
}

impl From<SubmissionError> for QueueError {
    fn from(err: SubmissionError) -> Self {
        QueueError::Validation(err.to_string())
    }
}

impl From<ConfigError> for QueueError {
    fn from(err: ConfigError) -> Self {
        QueueError::Validation(err.to_string())
    }
}
