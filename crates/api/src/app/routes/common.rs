//! Shared plumbing for the SSE endpoints.

use std::convert::Infallible;
use std::time::Duration;

use axum::http::{HeaderValue, header};
use axum::response::{
    IntoResponse,
    sse::{Event as SseEvent, KeepAlive, Sse},
};
use serde::Serialize;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

pub type SseResult = Result<SseEvent, Infallible>;

/// Tick interval for per-job streams.
pub const JOB_TICK: Duration = Duration::from_millis(500);

/// Tick interval for topic streams.
pub const TOPIC_TICK: Duration = Duration::from_secs(1);

/// Idle ticks between keepalive comments.
pub const KEEPALIVE_IDLE_TICKS: u32 = 15;

/// Wrap a channel receiver into an SSE response.
pub fn sse_response(rx: UnboundedReceiver<SseResult>) -> axum::response::Response {
    let stream = UnboundedReceiverStream::new(rx);
    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

/// Send a named event with a JSON payload. `Err` means the client is gone
/// (or the payload failed to serialize) and the producer loop should stop.
pub fn send_event<T: Serialize>(
    tx: &UnboundedSender<SseResult>,
    event: &str,
    payload: &T,
) -> Result<(), ()> {
    let data = serde_json::to_string(payload).map_err(|_| ())?;
    tx.send(Ok(SseEvent::default().event(event).data(data)))
        .map_err(|_| ())
}

/// Send a keepalive comment line.
pub fn send_keepalive(tx: &UnboundedSender<SseResult>) -> Result<(), ()> {
    tx.send(Ok(SseEvent::default().comment("keepalive")))
        .map_err(|_| ())
}
