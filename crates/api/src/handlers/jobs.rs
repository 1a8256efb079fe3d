//! Handlers for the `/jobs` resource.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use deployd_core::error::CoreError;
use deployd_core::types::JobId;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;
use crate::stream::{self, JobWatch};

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs
///
/// All jobs, newest first.
pub async fn list_jobs(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let jobs = state.store.list().await?;
    Ok(Json(DataResponse { data: jobs }))
}

/// GET /api/v1/jobs/{id}
///
/// Full snapshot of one job: status, output so far, progress, exit code.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let job = state.store.get(job_id).await?;
    Ok(Json(DataResponse { data: job }))
}

/// GET /api/v1/jobs/{id}/stream
///
/// Replay a job's output as server-sent events, then follow it live until
/// it finishes. Works for finished jobs too.
pub async fn stream_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let watch = JobWatch::attach(Arc::clone(&state.store), &state.bus, job_id).await?;
    Ok(stream::sse(watch))
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs/{id}/cancel
///
/// Cancel a pending or running job. Returns 204 once cancellation has been
/// requested, 409 if the job has already finished. The job records its
/// `failed` status shortly after.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let job = state.store.get(job_id).await?;

    if job.status.is_terminal() || !state.supervisor.cancel(job_id).await {
        return Err(AppError::Core(CoreError::Conflict(format!(
            "Job {job_id} is not running and cannot be cancelled"
        ))));
    }

    Ok(StatusCode::NO_CONTENT)
}
