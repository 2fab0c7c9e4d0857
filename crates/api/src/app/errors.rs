use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use docuflow_infra::EnqueueError;

pub fn enqueue_error_to_response(err: EnqueueError) -> axum::response::Response {
    match err {
        EnqueueError::Contended => json_error(
            StatusCode::TOO_MANY_REQUESTS,
            "enqueue_contended",
            "another request is enqueuing this operation; retry shortly",
        ),
        EnqueueError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        EnqueueError::Store(e) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            format!("{e}"),
        ),
        EnqueueError::Lock(e) => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "lock_unavailable",
            format!("{e}"),
        ),
        EnqueueError::Dispatch(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "dispatch_error", msg)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
