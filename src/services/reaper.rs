use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::EngineSettings;
use crate::models::job::Job;
use crate::services::queue::{JobQueue, QueueError};
use crate::services::retry::RetryPolicy;
use crate::services::worker::dlq_reason;

/// Counts from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub leases_expired: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
}

/// Reclaims jobs stranded by workers that died mid-flight.
///
/// - `processing` jobs past the lease their claimer took count as a failed attempt.
/// - `failed` jobs still not requeued `stale_failed_after` past their
///   scheduled release are requeued. A worker asleep in backoff is never
///   overtaken.
///
/// Both then go through the retry policy, so an exhausted job lands in the DLQ.
pub struct Reaper {
    queue: JobQueue,
    policy: RetryPolicy,
    stale_failed_after: Duration,
    interval: Duration,
    shutdown: CancellationToken,
}

impl Reaper {
    pub fn new(queue: JobQueue, settings: &EngineSettings, shutdown: CancellationToken) -> Self {
        Self {
            queue,
            policy: settings.retry_policy(),
            stale_failed_after: settings.stale_failed_after,
            interval: settings.sweep_interval,
            shutdown,
        }
    }

    /// Sweep once immediately, then every interval until cancelled.
    pub async fn run(self) {
        loop {
            match self.sweep_once().await {
                Ok(report) if report != SweepReport::default() => {
                    tracing::info!(
                        leases_expired = report.leases_expired,
                        requeued = report.requeued,
                        dead_lettered = report.dead_lettered,
                        "Sweep reclaimed stranded jobs"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Sweep failed"),
            }

            tokio::select! {
                _ = sleep(self.interval) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }
    }

    pub async fn sweep_once(&self) -> Result<SweepReport, QueueError> {
        let mut report = SweepReport::default();

        let expired = self.queue.expire_leases().await?;
        report.leases_expired = expired.len();
        for job in expired {
            tracing::warn!(job_id = %job.id, attempts = job.attempts, "Lease expired");
            self.route(job, &mut report).await?;
        }

        for job in self.queue.stale_failed(self.stale_failed_after).await? {
            self.route(job, &mut report).await?;
        }

        Ok(report)
    }

    async fn route(&self, job: Job, report: &mut SweepReport) -> Result<(), QueueError> {
        if self.policy.should_retry(job.attempts, job.max_retries) {
            if self.queue.requeue(&job.id, job.attempts).await? {
                report.requeued += 1;
            }
        } else {
            let last_error = job.error.as_deref().unwrap_or("unknown");
            let reason = dlq_reason(job.max_retries, last_error);
            if self.queue.move_to_dlq(&job.id, &reason).await?.is_some() {
                report.dead_lettered += 1;
            }
        }
        Ok(())
    }
}
