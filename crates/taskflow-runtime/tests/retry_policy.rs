//! Retry path: attempts transition pending → failed and raise reflection.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use taskflow_kernel::{
    DagNode, DagSnapshot, FailureCode, FailureMode, RunConstraintOverrides, RunConstraints,
    RunState, StepContract, StepStatus,
};
use taskflow_runtime::events::{EventBroker, EventEmitter};
use taskflow_runtime::llm::{CostEstimator, MockProvider, ModelRouter};
use taskflow_runtime::orchestration::ExecutorService;
use taskflow_runtime::persistence::{NewRun, Repository};
use taskflow_runtime::Settings;

fn blocked_dag() -> DagSnapshot {
    let mut contracts = HashMap::new();
    contracts.insert(
        "execute_task".to_string(),
        StepContract::default()
            .with_allowed_tools(vec![])
            .with_timeout_s(1)
            .with_max_retries(1),
    );
    DagSnapshot {
        nodes: vec![DagNode::new("execute_task", "Execute").with_description("run")],
        edges: vec![],
        contracts,
        planner_notes: None,
    }
}

#[tokio::test]
async fn retry_policy_transitions_pending_then_failed() {
    let settings = Arc::new(Settings::default());
    let repo = Arc::new(Repository::in_memory().await.unwrap());
    repo.create_run(&NewRun {
        id: "run-1".to_string(),
        task: "retry test".to_string(),
        template_id: None,
        constraints: RunConstraintOverrides {
            budget_usd: Some(10.0),
            timeout_s: Some(60),
            max_steps: Some(20),
            reflection_interval_steps: Some(5),
        },
        metadata: json!({}),
    })
    .await
    .unwrap();

    let broker = Arc::new(EventBroker::new());
    let emitter = Arc::new(EventEmitter::new(Arc::clone(&repo), broker));
    let executor = ExecutorService::new(
        Arc::clone(&repo),
        Arc::clone(&settings),
        Arc::new(MockProvider::new()),
        ModelRouter::new(Arc::clone(&settings)),
        CostEstimator::new(Arc::clone(&settings)),
        emitter,
    );

    let constraints = RunConstraints {
        budget_usd: 10.0,
        timeout_s: 60,
        max_steps: 20,
        reflection_interval_steps: 5,
    };
    let mut state =
        RunState::new("run-1", "retry test", constraints, "req-1").with_dag(blocked_dag());

    // First tick: attempt 1 of max_retries 1 → back to pending, not failed.
    executor.execute_next(&mut state).await.unwrap();
    let step = repo
        .get_step_by_node("run-1", "execute_task")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(step.status, StepStatus::Pending);
    assert_eq!(step.attempts, 1);
    assert!(!state.reflection_needed);
    assert_eq!(state.step_counter, 1);
    assert_eq!(
        state.dag.node("execute_task").unwrap().status,
        StepStatus::Pending
    );

    // Second tick: attempt 2 exhausts the budget → terminal failure.
    executor.execute_next(&mut state).await.unwrap();
    let step = repo
        .get_step_by_node("run-1", "execute_task")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.attempts, 2);
    assert!(step.ended_at.is_some());

    let error = step.error.unwrap();
    assert_eq!(error.code, FailureCode::ToolNotAllowed);

    assert!(state.reflection_needed);
    assert_eq!(state.failure_mode, Some(FailureMode::Other));
    assert_eq!(
        state.reflection_reason.as_deref(),
        Some("Step execute_task failed")
    );
    assert_eq!(state.step_counter, 2);
    assert_eq!(
        state.dag.node("execute_task").unwrap().status,
        StepStatus::Failed
    );

    // attempts ≤ max_retries + 1 at terminal.
    assert!(step.attempts <= step.max_retries + 1);
}
