use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::models::job::JobState;
use crate::services::queue::JobQueue;

#[derive(Clone)]
pub struct MetricsState {
    pub handle: Arc<PrometheusHandle>,
    pub queue: JobQueue,
}

/// Prometheus metrics scrape endpoint.
/// Refreshes the queue depth gauges, then renders the text exposition format.
pub async fn prometheus_metrics(State(state): State<MetricsState>) -> impl IntoResponse {
    match state.queue.summary().await {
        Ok(summary) => {
            metrics::gauge!("queue_depth").set(summary.count(JobState::Pending) as f64);
            metrics::gauge!("queue_dlq_size").set(summary.dlq as f64);
        }
        Err(e) => tracing::warn!(error = %e, "Failed to refresh queue depth gauges"),
    }
    state.handle.render()
}
