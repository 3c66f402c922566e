//! Event plumbing: durable append + live fan-out, and the SSE feed built
//! from both.

pub mod broker;
pub mod stream;

pub use broker::{EVENT_BUFFER_SIZE, EventBroker, EventStream};
pub use stream::{replay_then_tail, sse_frame, sse_frames};

use std::sync::Arc;

use serde_json::Value;
use taskflow_kernel::{EventType, RunEvent};

use crate::persistence::{PersistenceResult, Repository};

/// Writes an event to the store, then publishes it to the broker.
///
/// Store-then-publish is the ordering contract: a crash after the write
/// loses only the transient notification, never the durable record.
pub struct EventEmitter {
    repo: Arc<Repository>,
    broker: Arc<EventBroker>,
}

impl EventEmitter {
    pub fn new(repo: Arc<Repository>, broker: Arc<EventBroker>) -> Self {
        Self { repo, broker }
    }

    pub async fn emit(
        &self,
        run_id: &str,
        step_id: Option<&str>,
        event_type: EventType,
        payload: Value,
    ) -> PersistenceResult<RunEvent> {
        let event = self
            .repo
            .create_event(run_id, step_id, event_type, payload)
            .await?;
        self.broker.publish(&event);
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskflow_kernel::RunConstraintOverrides;
    use tokio_stream::StreamExt;

    use crate::persistence::NewRun;

    #[tokio::test]
    async fn emit_stores_then_publishes() {
        let repo = Arc::new(Repository::in_memory().await.unwrap());
        repo.create_run(&NewRun {
            id: "run-1".to_string(),
            task: "t".to_string(),
            template_id: None,
            constraints: RunConstraintOverrides::default(),
            metadata: json!({}),
        })
        .await
        .unwrap();
        let broker = Arc::new(EventBroker::new());
        let emitter = EventEmitter::new(Arc::clone(&repo), Arc::clone(&broker));

        let mut live = broker.subscribe("run-1");
        let emitted = emitter
            .emit("run-1", None, EventType::RunStarted, json!({"request_id": "r"}))
            .await
            .unwrap();

        let stored = repo.list_events("run-1", None).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0], emitted);
        assert_eq!(live.next().await.unwrap(), emitted);
    }
}
