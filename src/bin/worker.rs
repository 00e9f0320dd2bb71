use queuectl::{
    config::{AppConfig, EngineSettings},
    server,
    services::{queue::JobQueue, worker::WorkerPool},
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting queuectl worker daemon");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Initialize database
    tracing::info!("Opening job store");
    let queue = JobQueue::connect(&config.database_url)
        .await
        .expect("Failed to open job store");

    let settings = queue
        .engine_settings(EngineSettings::from_config(&config))
        .await
        .expect("Failed to load stored engine settings");
    server::describe_metrics();

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Shutdown signal received, finishing in-flight jobs");
        signal_token.cancel();
    });

    tracing::info!(
        workers = config.worker_count,
        poll_interval_ms = settings.poll_interval.as_millis() as u64,
        job_timeout_secs = settings.job_timeout.as_secs(),
        "Worker ready, starting job processing loop"
    );

    WorkerPool::new(queue, settings)
        .run(config.worker_count.max(1), shutdown)
        .await;
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
