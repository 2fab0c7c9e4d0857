use axum::{
    Router,
    routing::{get, post},
};

pub mod common;
pub mod jobs;
pub mod streams;
pub mod system;

/// Router for all owner-scoped endpoints.
pub fn router() -> Router {
    Router::new()
        // POST parses the key as a namespace, GET as a job id; the router
        // only allows one capture name per segment.
        .route("/jobs/:key", post(jobs::trigger_job).get(jobs::get_job))
        .route("/jobs/:key/stream", get(jobs::stream_job))
        .route("/streams/:topic", get(streams::stream_topic))
        .route("/admin/worker-stats", get(system::worker_stats))
}
