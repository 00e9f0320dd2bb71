use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::EngineSettings;
use crate::models::job::Job;
use crate::services::executor::{CommandExecutor, ExecutionError};
use crate::services::queue::{JobQueue, QueueError};
use crate::services::reaper::Reaper;
use crate::services::retry::RetryPolicy;

/// What happened to a claimed job during one worker iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded { job_id: String },
    Retrying { job_id: String, attempts: u32, delay: Duration },
    DeadLettered { job_id: String, attempts: u32 },
    /// The job left `processing` before the outcome could be recorded,
    /// e.g. the sweep expired its lease.
    Abandoned { job_id: String },
}

/// DLQ reason recorded when a job runs out of retries.
pub fn dlq_reason(max_retries: u32, last_error: &str) -> String {
    format!(
        "Max retries ({}) exceeded. Last error: {}",
        max_retries,
        last_error.trim()
    )
}

/// One claim → execute → report control loop.
///
/// Holds no job state between iterations; everything is re-read from the queue.
pub struct Worker {
    id: usize,
    queue: JobQueue,
    executor: CommandExecutor,
    policy: RetryPolicy,
    lease: Duration,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        id: usize,
        queue: JobQueue,
        settings: &EngineSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            queue,
            executor: CommandExecutor::new(settings.job_timeout),
            policy: settings.retry_policy(),
            lease: settings.lease_timeout(),
            poll_interval: settings.poll_interval,
            shutdown,
        }
    }

    /// Loop until cancelled. An in-flight command always runs to completion.
    pub async fn run(self) {
        tracing::info!(worker_id = self.id, "Worker started");

        while !self.shutdown.is_cancelled() {
            match self.process_next().await {
                Ok(Some(outcome)) => {
                    tracing::debug!(worker_id = self.id, ?outcome, "Job processed, checking for next job");
                }
                Ok(None) => {
                    tracing::trace!(worker_id = self.id, "No jobs available, sleeping");
                    self.idle().await;
                }
                Err(e) => {
                    tracing::error!(worker_id = self.id, error = %e, "Error processing job, will retry");
                    self.idle().await;
                }
            }
        }

        tracing::info!(worker_id = self.id, "Worker stopped");
    }

    async fn idle(&self) {
        tokio::select! {
            _ = sleep(self.poll_interval) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    /// Claim and fully handle at most one job.
    /// Returns Ok(None) if no job was available.
    pub async fn process_next(&self) -> Result<Option<JobOutcome>, QueueError> {
        let Some(job) = self.queue.claim_next(self.lease).await? else {
            return Ok(None);
        };

        tracing::info!(
            worker_id = self.id,
            job_id = %job.id,
            command = %job.command,
            attempt = job.attempts + 1,
            "Processing job"
        );

        let result = self.executor.run(&job.command).await;
        let outcome = match result {
            Ok(output) => {
                metrics::histogram!("queue_job_duration_seconds").record(output.duration.as_secs_f64());
                if !output.stderr.trim().is_empty() {
                    tracing::debug!(worker_id = self.id, job_id = %job.id, stderr = %output.stderr.trim(), "Job wrote to stderr");
                }

                if self.queue.report_success(&job.id, &output.stdout).await? {
                    metrics::counter!("queue_jobs_completed_total").increment(1);
                    tracing::info!(
                        worker_id = self.id,
                        job_id = %job.id,
                        duration_ms = output.duration.as_millis() as u64,
                        "Job completed successfully"
                    );
                    JobOutcome::Succeeded { job_id: job.id }
                } else {
                    tracing::warn!(worker_id = self.id, job_id = %job.id, "Job left processing before completion was recorded");
                    JobOutcome::Abandoned { job_id: job.id }
                }
            }
            Err(e) => self.handle_failure(job, e).await?,
        };

        Ok(Some(outcome))
    }

    async fn handle_failure(&self, job: Job, failure: ExecutionError) -> Result<JobOutcome, QueueError> {
        let error = failure.job_error();
        let output = match &failure {
            ExecutionError::NonZeroExit { stdout, .. } if !stdout.is_empty() => Some(stdout.as_str()),
            _ => None,
        };

        metrics::counter!("queue_jobs_failed_total").increment(1);
        tracing::warn!(
            worker_id = self.id,
            job_id = %job.id,
            error = %failure,
            timed_out = failure.is_timeout(),
            "Job attempt failed"
        );

        // job.attempts is still the pre-increment index
        let delay = self.policy.backoff(job.attempts);
        let Some(report) = self
            .queue
            .report_failure(&job.id, &error, output, delay)
            .await?
        else {
            tracing::warn!(worker_id = self.id, job_id = %job.id, "Job left processing before failure was recorded");
            return Ok(JobOutcome::Abandoned { job_id: job.id });
        };

        if !self.policy.should_retry(report.attempts, report.max_retries) {
            let reason = dlq_reason(report.max_retries, &error);
            self.queue.move_to_dlq(&job.id, &reason).await?;
            tracing::warn!(
                worker_id = self.id,
                job_id = %job.id,
                attempts = report.attempts,
                max_retries = report.max_retries,
                "Job moved to DLQ"
            );
            return Ok(JobOutcome::DeadLettered {
                job_id: job.id,
                attempts: report.attempts,
            });
        }

        tracing::info!(
            worker_id = self.id,
            job_id = %job.id,
            retry = report.attempts,
            max_retries = report.max_retries,
            delay_ms = delay.as_millis() as u64,
            "Waiting before retry"
        );

        tokio::select! {
            _ = sleep(delay) => {}
            _ = self.shutdown.cancelled() => {
                tracing::info!(worker_id = self.id, job_id = %job.id, "Shutdown requested, skipping backoff");
            }
        }

        if self.queue.requeue(&job.id, report.attempts).await? {
            metrics::counter!("queue_jobs_retried_total").increment(1);
            tracing::info!(worker_id = self.id, job_id = %job.id, "Job re-queued for retry");
        } else {
            tracing::debug!(worker_id = self.id, job_id = %job.id, "Job already left failed state");
        }

        Ok(JobOutcome::Retrying {
            job_id: job.id,
            attempts: report.attempts,
            delay,
        })
    }
}

/// N independent workers plus the lease-expiry sweep, sharing one queue.
pub struct WorkerPool {
    queue: JobQueue,
    settings: EngineSettings,
}

impl WorkerPool {
    pub fn new(queue: JobQueue, settings: EngineSettings) -> Self {
        Self { queue, settings }
    }

    /// Run `count` workers until `shutdown` is cancelled and every worker has
    /// finished its in-flight job.
    pub async fn run(&self, count: usize, shutdown: CancellationToken) {
        let mut tasks = JoinSet::new();

        let reaper = Reaper::new(self.queue.clone(), &self.settings, shutdown.clone());
        tasks.spawn(reaper.run());

        for id in 0..count {
            let worker = Worker::new(id, self.queue.clone(), &self.settings, shutdown.clone());
            tasks.spawn(worker.run());
        }

        tracing::info!(workers = count, "Worker pool started");

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker task terminated abnormally");
            }
        }

        tracing::info!("Worker pool stopped");
    }
}
