//! Topic streams: coarse change notifications driven by the topic cursors.

use std::sync::Arc;

use axum::extract::{Extension, Path};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tracing::debug;

use docuflow_jobs::TopicCursor;

use crate::app::routes::common::{
    KEEPALIVE_IDLE_TICKS, SseResult, TOPIC_TICK, send_event, send_keepalive, sse_response,
};
use crate::app::services::AppServices;
use crate::context::OwnerContext;

/// GET /streams/{topic}
///
/// Snapshot+tail: the connect-time snapshot carries the current cursor, then
/// every advance produces one `changed` event. No replay; a reconnect starts
/// from a fresh snapshot.
pub async fn stream_topic(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(_owner): Extension<OwnerContext>,
    Path(topic): Path<String>,
) -> axum::response::Response {
    let cursor = services.cursors.topic(&topic);

    let (tx, rx) = unbounded_channel::<SseResult>();
    tokio::task::spawn_blocking(move || topic_stream_loop(topic, cursor, tx));

    sse_response(rx)
}

fn topic_stream_loop(topic: String, cursor: Arc<TopicCursor>, tx: UnboundedSender<SseResult>) {
    let mut last_seen = cursor.current();
    if send_event(&tx, "snapshot", &serde_json::json!({"cursor": last_seen})).is_err() {
        return;
    }

    let mut idle_ticks = 0u32;
    loop {
        std::thread::sleep(TOPIC_TICK);

        let current = cursor.current();
        if current > last_seen {
            // Cursors only move forward, so per-connection events are
            // non-decreasing in cursor order.
            let payload = serde_json::json!({
                "cursor": current,
                "event": cursor.last_event(),
            });
            if send_event(&tx, "changed", &payload).is_err() {
                break;
            }
            last_seen = current;
            idle_ticks = 0;
        } else {
            idle_ticks += 1;
            if idle_ticks >= KEEPALIVE_IDLE_TICKS {
                if send_keepalive(&tx).is_err() {
                    debug!(topic = %topic, "stream client disconnected");
                    break;
                }
                idle_ticks = 0;
            }
        }
    }
}
