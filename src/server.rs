use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;
use crate::routes::{self, metrics::MetricsState};

/// API routes without the metrics endpoint (which needs an installed recorder).
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health::health_check))
        .route(
            "/api/v1/jobs",
            post(routes::jobs::submit_job).get(routes::jobs::list_jobs),
        )
        .route("/api/v1/jobs/{job_id}", get(routes::jobs::get_job))
        .route("/api/v1/status", get(routes::jobs::queue_status))
        .route("/api/v1/dlq", get(routes::dlq::list_dlq))
        .route("/api/v1/dlq/{job_id}/retry", post(routes::dlq::retry_dlq_job))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(64 * 1024)) // 64 KB limit
}

/// Serve the HTTP API on `bind_addr` until `shutdown` is cancelled.
pub async fn serve(
    state: AppState,
    bind_addr: &str,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    // Register application metrics
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ServerError::Metrics(e.to_string()))?;
    describe_metrics();

    let metrics_state = MetricsState {
        handle: Arc::new(prometheus_handle),
        queue: state.queue.clone(),
    };

    let app = build_router(state).route(
        "/metrics",
        get(routes::metrics::prometheus_metrics).with_state(metrics_state),
    );

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("Server listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

/// Describe every metric the engine emits.
pub fn describe_metrics() {
    metrics::describe_counter!("queue_jobs_submitted_total", "Total jobs submitted");
    metrics::describe_counter!("queue_jobs_completed_total", "Total jobs completed");
    metrics::describe_counter!("queue_jobs_failed_total", "Total failed job attempts");
    metrics::describe_counter!("queue_jobs_retried_total", "Total jobs re-queued for retry");
    metrics::describe_counter!(
        "queue_jobs_dead_lettered_total",
        "Total jobs moved to the dead-letter queue"
    );
    metrics::describe_counter!(
        "queue_leases_expired_total",
        "Processing jobs reclaimed by the lease-expiry sweep"
    );
    metrics::describe_histogram!(
        "queue_job_duration_seconds",
        "Wall-clock time of successful job runs"
    );
    metrics::describe_gauge!("queue_depth", "Current number of pending jobs");
    metrics::describe_gauge!("queue_dlq_size", "Current number of DLQ entries");
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to install metrics recorder: {0}")]
    Metrics(String),

    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}
