pub mod deploy;
pub mod health;
pub mod jobs;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /deploy                     submit a deployment, job snapshot (POST)
/// /deploy/stream              submit a deployment, live SSE output (POST)
///
/// /jobs                       list, newest first
/// /jobs/{id}                  job snapshot
/// /jobs/{id}/stream           attach to a job's output (SSE)
/// /jobs/{id}/cancel           cancel a running job (POST)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/deploy", deploy::router())
        .nest("/jobs", jobs::router())
}
