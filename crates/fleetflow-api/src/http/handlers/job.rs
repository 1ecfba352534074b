//! Job submission and inspection handlers.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use uuid::Uuid;

use fleetflow_types::job::{Job, JobStatus, JobSubmission};

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    /// Filter by status (`queued`, `running`, `succeeded`...).
    pub status: Option<String>,
    #[serde(default = "default_job_limit")]
    pub limit: u32,
}

fn default_job_limit() -> u32 {
    50
}

/// POST /api/v1/jobs - Submit a job. Rejected synchronously when no robot
/// could ever run it, the workflow is unknown or the queue is full.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(submission): Json<JobSubmission>,
) -> Result<(StatusCode, Json<ApiResponse<Job>>), AppError> {
    let start = Instant::now();
    let job = state.dispatcher.submit(submission).await?;
    let href = format!("/api/v1/jobs/{}", job.id);
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(job, start).with_link("self", &href)),
    ))
}

/// GET /api/v1/jobs - Newest first.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<ApiResponse<Vec<Job>>>, AppError> {
    let start = Instant::now();
    let status = query
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(AppError::Validation)?;
    let jobs = state.dispatcher.list_jobs(status, query.limit).await?;
    Ok(Json(ApiResponse::success(jobs, start).with_link("self", "/api/v1/jobs")))
}

/// GET /api/v1/jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Job>>, AppError> {
    let start = Instant::now();
    let job = state.dispatcher.get_job(&id).await?;
    let href = format!("/api/v1/jobs/{id}");
    Ok(Json(ApiResponse::success(job, start).with_link("self", &href)))
}

/// POST /api/v1/jobs/{id}/cancel
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Job>>, AppError> {
    let start = Instant::now();
    let job = state.dispatcher.cancel(id).await?;
    Ok(Json(ApiResponse::success(job, start)))
}
