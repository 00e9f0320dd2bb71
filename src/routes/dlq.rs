use axum::extract::{Path, State};
use axum::Json;

use crate::app_state::AppState;
use crate::models::dlq::DlqEntry;
use crate::models::submission::RetryDlqResponse;
use crate::routes::error::ApiError;

/// GET /api/v1/dlq
pub async fn list_dlq(State(state): State<AppState>) -> Result<Json<Vec<DlqEntry>>, ApiError> {
    Ok(Json(state.queue.list_dlq().await?))
}

/// POST /api/v1/dlq/{job_id}/retry: replay a dead-lettered job.
pub async fn retry_dlq_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<RetryDlqResponse>, ApiError> {
    if state.queue.retry_from_dlq(&job_id).await? {
        Ok(Json(RetryDlqResponse {
            job_id,
            requeued: true,
        }))
    } else {
        Err(ApiError::not_found(format!("Job {job_id} not found in DLQ")))
    }
}
