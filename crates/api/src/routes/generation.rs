//! Route definitions for generation jobs.

use axum::routing::{delete, get, post};
use axum::Router;

use crate::handlers::generation;
use crate::state::AppState;

/// Routes mounted at the root.
///
/// ```text
/// POST   /generate            -> generate
/// GET    /status/{job_id}     -> get_status
/// POST   /stop/{job_id}       -> stop_job
/// GET    /jobs                -> list_jobs
/// DELETE /jobs/{job_id}       -> delete_job
/// POST   /server-reset        -> server_reset
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/generate", post(generation::generate))
        .route("/status/{job_id}", get(generation::get_status))
        .route("/stop/{job_id}", post(generation::stop_job))
        .route("/jobs", get(generation::list_jobs))
        .route("/jobs/{job_id}", delete(generation::delete_job))
        .route("/server-reset", post(generation::server_reset))
}
