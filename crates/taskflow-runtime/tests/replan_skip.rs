//! Reflection on a schema failure replans by skipping the failed subtree.

use std::sync::Arc;

use serde_json::json;

use taskflow_kernel::{
    DagEdge, DagNode, DagSnapshot, EventType, FailureCode, FailureMode, ReflectionAction,
    RunConstraintOverrides, RunConstraints, RunState, StepStatus, StructuredError,
};
use taskflow_runtime::events::{EventBroker, EventEmitter};
use taskflow_runtime::orchestration::ReflectionService;
use taskflow_runtime::persistence::{NewRun, Repository};

fn chain_with_failed_head() -> DagSnapshot {
    let mut dag = DagSnapshot {
        nodes: vec![
            DagNode::new("A", "A"),
            DagNode::new("B", "B").depends_on("A"),
            DagNode::new("C", "C").depends_on("B"),
        ],
        edges: vec![DagEdge::new("A", "B"), DagEdge::new("B", "C")],
        ..Default::default()
    };
    let head = dag.node_mut("A").unwrap();
    head.status = StepStatus::Failed;
    head.last_error = Some(StructuredError::new(
        FailureCode::SchemaError,
        "Step output schema validation failed",
    ));
    dag
}

#[tokio::test]
async fn schema_failure_skips_descendants_and_records_diagnostic() {
    let repo = Arc::new(Repository::in_memory().await.unwrap());
    repo.create_run(&NewRun {
        id: "run-1".to_string(),
        task: "replan test".to_string(),
        template_id: None,
        constraints: RunConstraintOverrides::default(),
        metadata: json!({}),
    })
    .await
    .unwrap();

    let broker = Arc::new(EventBroker::new());
    let emitter = Arc::new(EventEmitter::new(Arc::clone(&repo), broker));
    let reflection = ReflectionService::new(Arc::clone(&repo), emitter);

    let mut state = RunState::new("run-1", "replan test", RunConstraints::default(), "req-1")
        .with_dag(chain_with_failed_head());
    state.request_reflection("Step A failed", FailureMode::SchemaError);

    reflection.reflect(&mut state).await.unwrap();

    for node_id in ["B", "C"] {
        let node = state.dag.node(node_id).unwrap();
        assert_eq!(node.status, StepStatus::Skipped);
        let error = node.last_error.clone().unwrap();
        assert_eq!(error.code, FailureCode::ExecutionError);
        assert_eq!(
            error.message,
            "Skipped due to upstream failure during replanning"
        );
        assert_eq!(error.details["upstream"], json!(["A"]));
    }
    // The failed head itself is untouched.
    assert_eq!(state.dag.node("A").unwrap().status, StepStatus::Failed);

    // Flags cleared, run not terminated: replanning keeps the loop alive.
    assert!(!state.reflection_needed);
    assert!(state.reflection_reason.is_none());
    assert!(state.failure_mode.is_none());
    assert!(!state.should_finish);

    let run = repo.get_run("run-1").await.unwrap().unwrap();
    assert_eq!(run.diagnostics.len(), 1);
    assert_eq!(run.diagnostics[0].failure_mode, FailureMode::SchemaError);
    assert_eq!(run.diagnostics[0].action_taken, ReflectionAction::Replanned);

    let events = repo.list_events("run-1", None).await.unwrap();
    let types: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
    assert!(types.contains(&EventType::Replanned));
    assert!(types.contains(&EventType::Reflection));
}

#[tokio::test]
async fn low_confidence_upgrades_next_tick_only() {
    let repo = Arc::new(Repository::in_memory().await.unwrap());
    repo.create_run(&NewRun {
        id: "run-2".to_string(),
        task: "adjust test".to_string(),
        template_id: None,
        constraints: RunConstraintOverrides::default(),
        metadata: json!({}),
    })
    .await
    .unwrap();
    let broker = Arc::new(EventBroker::new());
    let emitter = Arc::new(EventEmitter::new(Arc::clone(&repo), broker));
    let reflection = ReflectionService::new(Arc::clone(&repo), emitter);

    let mut state = RunState::new("run-2", "adjust test", RunConstraints::default(), "req-1");
    state.request_reflection("Periodic reflection boundary reached", FailureMode::LowConfidence);

    reflection.reflect(&mut state).await.unwrap();

    assert_eq!(
        state.reflection_model_preference,
        Some(taskflow_kernel::ModelPreference::Expensive)
    );
    assert!(!state.should_finish);

    // The hint is one-shot: the executor takes it on its next tick.
    let taken = state.reflection_model_preference.take();
    assert!(taken.is_some());
    assert!(state.reflection_model_preference.is_none());
}
