//! In-process event fan-out keyed by run id.
//!
//! Each run gets a `tokio::sync::broadcast` channel with a 256-slot ring
//! buffer. When a subscriber falls behind, the ring overwrites the oldest
//! buffered event, so slow consumers lose the head of their backlog and keep
//! the most recent events; producers never block. Durability is the events
//! table's job — consumers needing full history replay from the store first.

use futures::Stream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::pin::Pin;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::debug;

use taskflow_kernel::RunEvent;

/// Per-subscriber buffer capacity.
pub const EVENT_BUFFER_SIZE: usize = 256;

/// Lazy event sequence handed to subscribers.
pub type EventStream = Pin<Box<dyn Stream<Item = RunEvent> + Send>>;

/// Ephemeral pub/sub broker. Channels are created on first subscribe and
/// pruned once the last subscriber is gone.
#[derive(Default)]
pub struct EventBroker {
    channels: Mutex<HashMap<String, broadcast::Sender<RunEvent>>>,
}

impl EventBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a run's live events. Lagged subscribers skip the
    /// overwritten events and continue with the next available one.
    pub fn subscribe(&self, run_id: &str) -> EventStream {
        let receiver = {
            let mut channels = self.channels.lock();
            channels
                .entry(run_id.to_string())
                .or_insert_with(|| broadcast::channel(EVENT_BUFFER_SIZE).0)
                .subscribe()
        };

        let run_id = run_id.to_string();
        let stream = BroadcastStream::new(receiver).filter_map(move |item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                debug!(run_id = %run_id, missed, "subscriber lagged; dropping oldest events");
                None
            }
        });
        Box::pin(stream)
    }

    /// Publish to every current subscriber of the event's run.
    /// A run with no subscribers is a no-op.
    pub fn publish(&self, event: &RunEvent) {
        let mut channels = self.channels.lock();
        if let Some(sender) = channels.get(&event.run_id) {
            if sender.receiver_count() == 0 {
                channels.remove(&event.run_id);
            } else {
                let _ = sender.send(event.clone());
            }
        }
    }

    /// Number of live subscribers for a run.
    pub fn subscriber_count(&self, run_id: &str) -> usize {
        self.channels
            .lock()
            .get(run_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskflow_kernel::EventType;

    fn event(run_id: &str, seq: i64) -> RunEvent {
        RunEvent::new(run_id, None, EventType::StepStarted, json!({"seq": seq}))
    }

    #[tokio::test]
    async fn fan_out_reaches_all_subscribers() {
        let broker = EventBroker::new();
        let mut first = broker.subscribe("run-1");
        let mut second = broker.subscribe("run-1");
        let mut other = broker.subscribe("run-2");

        broker.publish(&event("run-1", 1));

        assert_eq!(first.next().await.unwrap().payload["seq"], 1);
        assert_eq!(second.next().await.unwrap().payload["seq"], 1);

        broker.publish(&event("run-2", 9));
        assert_eq!(other.next().await.unwrap().payload["seq"], 9);
    }

    #[tokio::test]
    async fn slow_subscriber_keeps_most_recent_events() {
        let broker = EventBroker::new();
        let mut slow = broker.subscribe("run-1");

        let overflow = EVENT_BUFFER_SIZE as i64 + 10;
        for seq in 0..overflow {
            broker.publish(&event("run-1", seq));
        }

        // The oldest events were dropped; the first delivered one is late
        // enough that the buffer ends exactly on the newest event.
        let first_seen = slow.next().await.unwrap().payload["seq"].as_i64().unwrap();
        assert!(first_seen >= overflow - EVENT_BUFFER_SIZE as i64);

        let mut last_seen = first_seen;
        while let Ok(Some(ev)) =
            tokio::time::timeout(std::time::Duration::from_millis(50), slow.next()).await
        {
            last_seen = ev.payload["seq"].as_i64().unwrap();
        }
        assert_eq!(last_seen, overflow - 1);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let broker = EventBroker::new();
        broker.publish(&event("run-1", 1));
        assert_eq!(broker.subscriber_count("run-1"), 0);
    }

    #[tokio::test]
    async fn dropping_the_stream_unsubscribes() {
        let broker = EventBroker::new();
        let stream = broker.subscribe("run-1");
        assert_eq!(broker.subscriber_count("run-1"), 1);
        drop(stream);
        assert_eq!(broker.subscriber_count("run-1"), 0);
    }
}
