//! Worker loop, pool and sweep behaviour against a real SQLite database.

mod helpers;

use helpers::*;
use queuectl::config::EngineSettings;
use queuectl::models::job::JobState;
use queuectl::services::reaper::{Reaper, SweepReport};
use queuectl::services::worker::{JobOutcome, Worker, WorkerPool};
use queuectl::JobQueue;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn worker(id: usize, queue: &JobQueue, settings: &EngineSettings) -> Worker {
    Worker::new(id, queue.clone(), settings, CancellationToken::new())
}

/// A worker whose shutdown is already requested: `process_next` still
/// handles one job fully, but backoff sleeps are skipped.
fn worker_without_backoff(queue: &JobQueue, settings: &EngineSettings) -> Worker {
    let token = CancellationToken::new();
    token.cancel();
    Worker::new(0, queue.clone(), settings, token)
}

#[tokio::test]
async fn test_echo_job_completes() {
    let t = test_queue().await;
    let id = t.queue.submit("echo hello", 2).await.unwrap();

    let shutdown = CancellationToken::new();
    let pool = WorkerPool::new(t.queue.clone(), fast_settings());
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { pool.run(1, token).await });

    let job = wait_for_state(&t.queue, &id, JobState::Completed, 10).await;
    assert!(job.output.as_deref().unwrap_or_default().contains("hello"));
    assert_eq!(job.attempts, 0);
    assert!(job.error.is_none());

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_failing_job_is_dead_lettered_after_retry() {
    let t = test_queue().await;
    let id = t.queue.submit("exit 1", 1).await.unwrap();

    let shutdown = CancellationToken::new();
    let pool = WorkerPool::new(t.queue.clone(), fast_settings());
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { pool.run(1, token).await });

    // one retry with a 1s backoff, then the DLQ
    wait_for_dlq(&t.queue, &id, 15).await;
    shutdown.cancel();
    handle.await.unwrap();

    let entry = t.queue.get_dlq_entry(&id).await.unwrap().unwrap();
    assert_eq!(entry.attempts, 2);
    assert_eq!(entry.max_retries, 1);
    assert!(entry.reason.contains("Max retries (1) exceeded"), "{}", entry.reason);
    assert!(t.queue.get_job(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_two_workers_one_job() {
    let t = test_queue().await;
    let id = t.queue.submit("sleep 0.2", 0).await.unwrap();
    let settings = fast_settings();

    let a = worker(0, &t.queue, &settings);
    let b = worker(1, &t.queue, &settings);
    let (ra, rb) = tokio::join!(a.process_next(), b.process_next());

    let outcomes: Vec<_> = [ra.unwrap(), rb.unwrap()].into_iter().flatten().collect();
    assert_eq!(outcomes, vec![JobOutcome::Succeeded { job_id: id.clone() }]);
    assert_eq!(
        t.queue.get_job(&id).await.unwrap().unwrap().state,
        JobState::Completed
    );
}

#[tokio::test]
async fn test_idle_worker_reports_no_work() {
    let t = test_queue().await;
    let w = worker(0, &t.queue, &fast_settings());
    assert_eq!(w.process_next().await.unwrap(), None);
}

#[tokio::test]
async fn test_retry_ceiling_is_respected() {
    let t = test_queue().await;
    let id = t.queue.submit("false", 3).await.unwrap();
    let w = worker_without_backoff(&t.queue, &fast_settings());

    let mut retries = 0;
    loop {
        match w.process_next().await.unwrap().expect("job should be claimable") {
            JobOutcome::Retrying { attempts, .. } => {
                retries += 1;
                assert_eq!(attempts, retries);
                let job = t.queue.get_job(&id).await.unwrap().unwrap();
                assert_eq!(job.state, JobState::Pending);
                assert_eq!(job.attempts, retries);
            }
            JobOutcome::DeadLettered { job_id, attempts } => {
                assert_eq!(job_id, id);
                assert_eq!(attempts, 4);
                break;
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(retries, 3);
    assert!(w.process_next().await.unwrap().is_none());
    assert_eq!(t.queue.get_dlq_entry(&id).await.unwrap().unwrap().attempts, 4);
}

#[tokio::test]
async fn test_zero_retries_dead_letters_on_first_failure() {
    let t = test_queue().await;
    let id = t.queue.submit("sh -c 'echo nope >&2; exit 2'", 0).await.unwrap();
    let w = worker_without_backoff(&t.queue, &fast_settings());

    let outcome = w.process_next().await.unwrap().unwrap();
    assert_eq!(
        outcome,
        JobOutcome::DeadLettered {
            job_id: id.clone(),
            attempts: 1
        }
    );

    let entry = t.queue.get_dlq_entry(&id).await.unwrap().unwrap();
    assert!(entry.reason.contains("Max retries (0)"));
    assert!(entry.reason.contains("nope"));
    assert_eq!(entry.original_job.error.as_deref().map(str::trim), Some("nope"));
}

#[tokio::test]
async fn test_backoff_delay_grows_with_attempts() {
    let t = test_queue().await;
    let id = t.queue.submit("false", 3).await.unwrap();
    let w = worker_without_backoff(&t.queue, &fast_settings());

    let mut delays = Vec::new();
    while let Some(JobOutcome::Retrying { delay, .. }) = w.process_next().await.unwrap() {
        delays.push(delay);
    }

    // base 2, no jitter: backoff(attempts - 1)
    assert_eq!(
        delays,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4)
        ]
    );
    assert!(t.queue.get_dlq_entry(&id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_timeout_counts_as_failure() {
    let t = test_queue().await;
    let id = t.queue.submit("sleep 5", 0).await.unwrap();
    let settings = EngineSettings {
        job_timeout: Duration::from_millis(200),
        ..fast_settings()
    };
    let w = worker_without_backoff(&t.queue, &settings);

    let outcome = w.process_next().await.unwrap().unwrap();
    assert!(matches!(outcome, JobOutcome::DeadLettered { .. }));

    let entry = t.queue.get_dlq_entry(&id).await.unwrap().unwrap();
    assert!(entry.reason.contains("timed out"), "{}", entry.reason);
}

#[tokio::test]
async fn test_shutdown_finishes_in_flight_job() {
    let t = test_queue().await;
    let id = t.queue.submit("sleep 0.5", 0).await.unwrap();

    let shutdown = CancellationToken::new();
    let pool = WorkerPool::new(t.queue.clone(), fast_settings());
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { pool.run(2, token).await });

    wait_for_state(&t.queue, &id, JobState::Processing, 10).await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("pool stops after in-flight job")
        .unwrap();

    let job = t.queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
}

#[tokio::test]
async fn test_shutdown_during_backoff_still_requeues() {
    let t = test_queue().await;
    let id = t.queue.submit("false", 5).await.unwrap();
    // three earlier attempts with base 10 put the next backoff at 1000s
    sqlx::query("UPDATE jobs SET attempts = 3 WHERE id = ?1")
        .bind(&id)
        .execute(t.queue.pool())
        .await
        .unwrap();
    let settings = EngineSettings {
        backoff_base: 10.0,
        ..fast_settings()
    };

    let token = CancellationToken::new();
    let w = Worker::new(0, t.queue.clone(), &settings, token.clone());
    let handle = tokio::spawn(async move { w.process_next().await });

    wait_for_state(&t.queue, &id, JobState::Failed, 10).await;
    token.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("backoff is skipped on shutdown")
        .unwrap()
        .unwrap();
    match outcome {
        Some(JobOutcome::Retrying { attempts, delay, .. }) => {
            assert_eq!(attempts, 4);
            assert_eq!(delay, Duration::from_secs(1000));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(
        t.queue.get_job(&id).await.unwrap().unwrap().state,
        JobState::Pending
    );
}

fn sweep_settings() -> EngineSettings {
    EngineSettings {
        stale_failed_after: Duration::ZERO,
        ..fast_settings()
    }
}

#[tokio::test]
async fn test_sweep_reclaims_abandoned_processing_job() {
    let t = test_queue().await;
    let id = t.queue.submit("true", 1).await.unwrap();
    // a worker claims it and dies without reporting; its lease lapses at once
    t.queue.claim_next(Duration::ZERO).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let reaper = Reaper::new(t.queue.clone(), &sweep_settings(), CancellationToken::new());
    let report = reaper.sweep_once().await.unwrap();
    assert_eq!(
        report,
        SweepReport {
            leases_expired: 1,
            requeued: 1,
            dead_lettered: 0
        }
    );

    let job = t.queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 1);

    // abandoned again: the retry budget is spent, so it goes to the DLQ
    t.queue.claim_next(Duration::ZERO).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let report = reaper.sweep_once().await.unwrap();
    assert_eq!(report.dead_lettered, 1);
    assert!(t.queue.get_job(&id).await.unwrap().is_none());
    let entry = t.queue.get_dlq_entry(&id).await.unwrap().unwrap();
    assert!(entry.reason.contains("Lease expired"));
}

#[tokio::test]
async fn test_sweep_requeues_stranded_failed_job() {
    let t = test_queue().await;
    let id = t.queue.submit("false", 3).await.unwrap();
    // killed between report_failure and requeue
    t.queue.claim_next(LEASE).await.unwrap().unwrap();
    t.queue.report_failure(&id, "boom", None, Duration::ZERO).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let reaper = Reaper::new(t.queue.clone(), &sweep_settings(), CancellationToken::new());
    let report = reaper.sweep_once().await.unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(report.leases_expired, 0);

    let job = t.queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn test_sweep_leaves_healthy_jobs_alone() {
    let t = test_queue().await;
    t.queue.submit("true", 1).await.unwrap();
    t.queue.claim_next(LEASE).await.unwrap().unwrap();

    let reaper = Reaper::new(t.queue.clone(), &fast_settings(), CancellationToken::new());
    assert_eq!(reaper.sweep_once().await.unwrap(), SweepReport::default());
    assert_eq!(
        t.queue.summary().await.unwrap().count(JobState::Processing),
        1
    );
}

#[tokio::test]
async fn test_sweep_does_not_overtake_a_worker_in_backoff() {
    let t = test_queue().await;
    let id = t.queue.submit("false", 5).await.unwrap();
    // base 10 with three earlier attempts: a 1000s backoff
    sqlx::query("UPDATE jobs SET attempts = 3 WHERE id = ?1")
        .bind(&id)
        .execute(t.queue.pool())
        .await
        .unwrap();
    let settings = EngineSettings {
        backoff_base: 10.0,
        ..sweep_settings()
    };

    let token = CancellationToken::new();
    let w = Worker::new(0, t.queue.clone(), &settings, token.clone());
    let handle = tokio::spawn(async move { w.process_next().await });

    wait_for_state(&t.queue, &id, JobState::Failed, 10).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // stale_failed_after is zero, but the owning worker is still asleep
    let reaper = Reaper::new(t.queue.clone(), &settings, CancellationToken::new());
    assert_eq!(reaper.sweep_once().await.unwrap(), SweepReport::default());
    let job = t.queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 4);
    assert!(t.queue.claim_next(LEASE).await.unwrap().is_none());

    token.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("backoff is skipped on shutdown")
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, Some(JobOutcome::Retrying { attempts: 4, .. })));
    assert_eq!(
        t.queue.get_job(&id).await.unwrap().unwrap().state,
        JobState::Pending
    );
}

#[tokio::test]
async fn test_sweep_honours_the_claimers_timeout() {
    let t = test_queue().await;
    let id = t.queue.submit("sleep 1", 0).await.unwrap();

    // this pool allows long jobs
    let long = EngineSettings {
        job_timeout: Duration::from_secs(3600),
        ..fast_settings()
    };
    let w = worker(0, &t.queue, &long);
    let handle = tokio::spawn(async move { w.process_next().await });
    wait_for_state(&t.queue, &id, JobState::Processing, 10).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // another pool with a much shorter timeout sweeps meanwhile
    let short = EngineSettings {
        job_timeout: Duration::ZERO,
        lease_grace: Duration::ZERO,
        ..sweep_settings()
    };
    let reaper = Reaper::new(t.queue.clone(), &short, CancellationToken::new());
    assert_eq!(reaper.sweep_once().await.unwrap(), SweepReport::default());
    assert_eq!(
        t.queue.get_job(&id).await.unwrap().unwrap().state,
        JobState::Processing
    );
    assert!(t.queue.claim_next(LEASE).await.unwrap().is_none());

    let outcome = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("job finishes")
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, Some(JobOutcome::Succeeded { .. })));
    let job = t.queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts, 0);
}
