//! Job endpoints: trigger, poll, and live progress stream.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tracing::debug;

use docuflow_core::JobId;
use docuflow_infra::EnqueueRequest;
use docuflow_jobs::{Job, JobNamespace, JobStatus, JobStore};

use crate::app::dto::{ItemView, JobDetailResponse, JobView, TriggerJobRequest, TriggerJobResponse};
use crate::app::errors::{enqueue_error_to_response, json_error};
use crate::app::routes::common::{
    JOB_TICK, KEEPALIVE_IDLE_TICKS, SseResult, send_event, send_keepalive, sse_response,
};
use crate::app::services::AppServices;
use crate::context::OwnerContext;

/// POST /jobs/{namespace}
pub async fn trigger_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(owner): Extension<OwnerContext>,
    Path(key): Path<String>,
    Json(body): Json<TriggerJobRequest>,
) -> axum::response::Response {
    let namespace: JobNamespace = match key.parse() {
        Ok(namespace) => namespace,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, "invalid_namespace", e.to_string()),
    };

    let request = EnqueueRequest {
        namespace,
        owner_id: owner.owner_id(),
        scope: body.scope,
        params: body.params,
        units: body.units,
    };

    match services.enqueue.enqueue(request) {
        Ok(outcome) => (
            StatusCode::ACCEPTED,
            Json(TriggerJobResponse::new(
                &outcome.job,
                outcome.queued,
                outcome.deduplicated,
            )),
        )
            .into_response(),
        Err(e) => enqueue_error_to_response(e),
    }
}

/// GET /jobs/{id} — poll fallback for clients without SSE.
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(owner): Extension<OwnerContext>,
    Path(key): Path<String>,
) -> axum::response::Response {
    let job = match load_visible_job(&services, &owner, &key) {
        Ok(job) => job,
        Err(response) => return response,
    };

    let units = match services.store.list_items(job.id) {
        Ok(items) => items.iter().map(ItemView::from).collect(),
        Err(e) => {
            return json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "store_error",
                format!("{e}"),
            );
        }
    };

    Json(JobDetailResponse {
        job: JobView::from(&job),
        units,
    })
    .into_response()
}

/// GET /jobs/{id}/stream — SSE progress stream (ownership enforced like GET).
pub async fn stream_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(owner): Extension<OwnerContext>,
    Path(key): Path<String>,
) -> axum::response::Response {
    let job = match load_visible_job(&services, &owner, &key) {
        Ok(job) => job,
        Err(response) => return response,
    };

    let (tx, rx) = unbounded_channel::<SseResult>();
    let store = services.store.clone();
    tokio::task::spawn_blocking(move || job_stream_loop(store, job.id, tx));

    sse_response(rx)
}

/// Parse, load, and authorize; missing and not-owned are both 404 so job ids
/// never leak across owners.
fn load_visible_job(
    services: &AppServices,
    owner: &OwnerContext,
    key: &str,
) -> Result<Job, axum::response::Response> {
    let job_id: JobId = key
        .parse()
        .map_err(|_| json_error(StatusCode::NOT_FOUND, "not_found", "job not found"))?;

    let job = services
        .store
        .get_job(job_id)
        .map_err(|e| {
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "store_error",
                format!("{e}"),
            )
        })?
        .ok_or_else(|| json_error(StatusCode::NOT_FOUND, "not_found", "job not found"))?;

    if !owner.can_view(job.owner_id) {
        return Err(json_error(StatusCode::NOT_FOUND, "not_found", "job not found"));
    }
    Ok(job)
}

/// Snapshot, then re-read every tick and emit deltas until terminal.
fn job_stream_loop(store: Arc<dyn JobStore>, job_id: JobId, tx: UnboundedSender<SseResult>) {
    let mut last: Option<JobView> = None;
    let mut idle_ticks = 0u32;

    loop {
        let job = match store.get_job(job_id) {
            Ok(Some(job)) => job,
            Ok(None) => {
                let _ = send_event(
                    &tx,
                    "error",
                    &serde_json::json!({"message": "job no longer exists"}),
                );
                break;
            }
            Err(e) => {
                let _ = send_event(&tx, "error", &serde_json::json!({"message": e.to_string()}));
                break;
            }
        };
        let view = JobView::from(&job);
        let changed = last.as_ref() != Some(&view);

        if last.is_none() && send_event(&tx, "snapshot", &view).is_err() {
            break;
        }

        if job.status.is_terminal() {
            let terminal = if job.status == JobStatus::Failed {
                "error"
            } else {
                "complete"
            };
            let _ = send_event(&tx, terminal, &view);
            break;
        }

        if changed {
            if last.is_some() && send_event(&tx, "progress", &view).is_err() {
                break;
            }
            last = Some(view);
            idle_ticks = 0;
        } else {
            idle_ticks += 1;
            if idle_ticks >= KEEPALIVE_IDLE_TICKS {
                if send_keepalive(&tx).is_err() {
                    debug!(job_id = %job_id, "stream client disconnected");
                    break;
                }
                idle_ticks = 0;
            }
        }

        std::thread::sleep(JOB_TICK);
    }
}
