use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use std::str::FromStr;

use crate::app_state::AppState;
use crate::models::job::{Job, JobState, QueueSummary};
use crate::models::submission::{SubmitJobRequest, SubmitJobResponse};
use crate::routes::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub state: Option<String>,
}

/// POST /api/v1/jobs: enqueue a command.
pub async fn submit_job(
    State(state): State<AppState>,
    payload: Result<Json<SubmitJobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::validation(e.body_text()))?;
    let new_job = request.into_new_job().map_err(|e| ApiError::validation(e.to_string()))?;

    let settings = state.effective_settings().await?;
    let job = state
        .queue
        .submit_new(new_job, settings.default_max_retries)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(SubmitJobResponse {
            job_id: job.id,
            state: job.state,
        }),
    ))
}

/// GET /api/v1/jobs?state=pending: list jobs in one state (default `pending`).
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let job_state = match query.state.as_deref() {
        Some(raw) => JobState::from_str(raw)
            .map_err(|_| ApiError::validation(format!("Unknown job state '{raw}'")))?,
        None => JobState::Pending,
    };
    Ok(Json(state.queue.list_by_state(job_state).await?))
}

/// GET /api/v1/jobs/{job_id}: look up one live job.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    state
        .queue
        .get_job(&job_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Job {job_id} not found")))
}

/// GET /api/v1/status: counts per state plus DLQ size.
pub async fn queue_status(State(state): State<AppState>) -> Result<Json<QueueSummary>, ApiError> {
    Ok(Json(state.queue.summary().await?))
}
