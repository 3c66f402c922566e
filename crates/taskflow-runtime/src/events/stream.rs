//! Replay-then-tail event feeds and SSE framing.
//!
//! A consumer joining at an arbitrary point reconstructs full history by
//! reading the events table first, then tailing the broker subscription.
//! The SSE layer frames each event as `event: <type>` / `data: <json>` and
//! emits a keepalive comment when the feed goes quiet.

use std::time::Duration;

use futures::Stream;
use std::pin::Pin;
use tokio_stream::StreamExt;

use taskflow_kernel::RunEvent;

use super::broker::{EventBroker, EventStream};
use crate::persistence::{PersistenceResult, Repository};

/// Seconds of silence before a keepalive comment is sent.
pub const KEEPALIVE_INTERVAL_S: u64 = 15;

const KEEPALIVE_FRAME: &str = ": keepalive\n\n";

/// Stored history in `(created_at, id)` order, then the live tail.
///
/// The subscription is opened before history is read, so nothing published
/// in between is missed (an event may appear in both; consumers tolerate
/// replayed duplicates).
pub async fn replay_then_tail(
    repo: &Repository,
    broker: &EventBroker,
    run_id: &str,
) -> PersistenceResult<EventStream> {
    let tail = broker.subscribe(run_id);
    let history = repo.list_events(run_id, None).await?;
    Ok(Box::pin(tokio_stream::iter(history).chain(tail)))
}

/// One SSE frame for an event.
pub fn sse_frame(event: &RunEvent) -> String {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    format!("event: {}\ndata: {}\n\n", event.event_type, data)
}

/// Frame an event stream for SSE delivery, inserting `: keepalive` comments
/// whenever no event arrives within [`KEEPALIVE_INTERVAL_S`].
pub fn sse_frames(events: EventStream) -> Pin<Box<dyn Stream<Item = String> + Send>> {
    let framed = events
        .timeout(Duration::from_secs(KEEPALIVE_INTERVAL_S))
        .map(|item| match item {
            Ok(event) => sse_frame(&event),
            Err(_elapsed) => KEEPALIVE_FRAME.to_string(),
        });
    Box::pin(framed)
}
