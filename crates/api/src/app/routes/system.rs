use std::sync::Arc;

use axum::{
    Json,
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
};

use crate::app::errors::json_error;
use crate::app::services::AppServices;
use crate::context::OwnerContext;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// GET /admin/worker-stats — operational visibility, admin only.
pub async fn worker_stats(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(owner): Extension<OwnerContext>,
) -> axum::response::Response {
    if !owner.is_admin() {
        return json_error(StatusCode::FORBIDDEN, "forbidden", "admin role required");
    }
    Json(services.worker_stats()).into_response()
}
