//! Shared setup for integration tests: a fresh on-disk queue per test.
#![allow(dead_code)]

use queuectl::config::EngineSettings;
use queuectl::models::job::{Job, JobState};
use queuectl::services::queue::JobQueue;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{sleep, Instant};

/// A migrated queue backed by a SQLite file that lives as long as this value.
pub struct TestQueue {
    pub queue: JobQueue,
    pub database_url: String,
    _dir: TempDir,
}

pub async fn test_queue() -> TestQueue {
    let dir = tempfile::tempdir().expect("tempdir");
    let database_url = format!("sqlite://{}", dir.path().join("queue.db").display());
    let queue = JobQueue::connect(&database_url)
        .await
        .expect("Failed to open test queue");
    TestQueue {
        queue,
        database_url,
        _dir: dir,
    }
}

/// Claim lease used by tests that drive the queue directly.
pub const LEASE: Duration = Duration::from_secs(600);

/// Engine settings tuned for tests: fast polling, no jitter.
pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        poll_interval: Duration::from_millis(20),
        job_timeout: Duration::from_secs(10),
        backoff_base: 2.0,
        backoff_max_jitter: 0.0,
        default_max_retries: 3,
        lease_grace: Duration::from_secs(60),
        stale_failed_after: Duration::from_secs(3600),
        sweep_interval: Duration::from_secs(30),
    }
}

/// Poll until the job reaches `state` or the timeout elapses.
pub async fn wait_for_state(queue: &JobQueue, job_id: &str, state: JobState, timeout_secs: u64) -> Job {
    let deadline = Instant::now() + Duration::from_secs(timeout_secs);
    loop {
        if let Some(job) = queue.get_job(job_id).await.expect("get_job") {
            if job.state == state {
                return job;
            }
        }
        if Instant::now() > deadline {
            panic!("Job {job_id} did not reach {state} within {timeout_secs} seconds");
        }
        sleep(Duration::from_millis(25)).await;
    }
}

/// Poll until the job shows up in the DLQ.
pub async fn wait_for_dlq(queue: &JobQueue, job_id: &str, timeout_secs: u64) {
    let deadline = Instant::now() + Duration::from_secs(timeout_secs);
    while queue.get_dlq_entry(job_id).await.expect("get_dlq_entry").is_none() {
        if Instant::now() > deadline {
            panic!("Job {job_id} was not dead-lettered within {timeout_secs} seconds");
        }
        sleep(Duration::from_millis(25)).await;
    }
}
