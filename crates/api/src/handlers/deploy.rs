//! Handlers for deployment submission.
//!
//! Both endpoints validate the flat `flag -> value` body against the flag
//! schema before anything is created: a rejected request leaves no job
//! record and starts no process.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use deployd_worker::live::DEFAULT_LIVE_BUFFER;
use deployd_worker::LiveSink;
use serde_json::{Map, Value};

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;
use crate::stream::{self, LiveFeed};

/// Response header carrying the id of the job behind a live stream.
pub const JOB_ID_HEADER: &str = "x-job-id";

/// POST /api/v1/deploy
///
/// Create and start a deployment job. Returns 202 with the job as created;
/// poll `GET /api/v1/jobs/{id}` for progress.
pub async fn deploy(
    State(state): State<AppState>,
    Json(params): Json<Map<String, Value>>,
) -> AppResult<impl IntoResponse> {
    let command = state.schema.build(&params)?;
    let job = state
        .supervisor
        .submit(Value::Object(params), &command, None)
        .await?;

    tracing::info!(job_id = %job.id, "Deployment submitted");

    Ok((StatusCode::ACCEPTED, Json(DataResponse { data: job })))
}

/// POST /api/v1/deploy/stream
///
/// Create and start a deployment job, answering with its live output as
/// server-sent events. Disconnecting does not cancel the job.
pub async fn deploy_stream(
    State(state): State<AppState>,
    Json(params): Json<Map<String, Value>>,
) -> AppResult<impl IntoResponse> {
    let command = state.schema.build(&params)?;
    let (sink, events) = LiveSink::channel(DEFAULT_LIVE_BUFFER, state.config.live_send_timeout());
    let job = state
        .supervisor
        .submit(Value::Object(params), &command, Some(sink))
        .await?;

    tracing::info!(job_id = %job.id, "Streaming deployment submitted");

    let feed = LiveFeed::new(
        events,
        Arc::clone(&state.store),
        Arc::clone(&state.bus),
        job.id,
    );
    Ok(([(JOB_ID_HEADER, job.id.to_string())], stream::sse(feed)))
}
