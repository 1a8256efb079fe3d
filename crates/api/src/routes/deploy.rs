//! Route definitions for deployment submission.

use axum::routing::post;
use axum::Router;

use crate::handlers::deploy;
use crate::state::AppState;

/// Routes mounted at `/deploy`.
///
/// ```text
/// POST   /          -> deploy
/// POST   /stream    -> deploy_stream
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(deploy::deploy))
        .route("/stream", post(deploy::deploy_stream))
}
