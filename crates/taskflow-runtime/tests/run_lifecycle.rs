//! End-to-end run lifecycle against the in-memory store and mock provider.

use std::sync::Arc;
use std::time::Duration;

use tokio_stream::StreamExt;

use taskflow_kernel::{EventType, RunConstraintOverrides, RunStatus, StepStatus};
use taskflow_runtime::llm::MockProvider;
use taskflow_runtime::persistence::RunRecord;
use taskflow_runtime::{RunRequest, Settings, Taskflow};

async fn wait_for_terminal(taskflow: &Taskflow, run_id: &str) -> RunRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(8);
    loop {
        let run = taskflow
            .get_run(run_id)
            .await
            .unwrap()
            .expect("run exists");
        if run.status.is_terminal() {
            return run;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run did not reach a terminal state in time"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn count_events(events: &[taskflow_kernel::RunEvent], ty: EventType) -> usize {
    events.iter().filter(|e| e.event_type == ty).count()
}

#[tokio::test]
async fn happy_path_completes_with_full_event_trail() {
    let taskflow = Taskflow::start(Settings::default()).await.unwrap();
    let run = taskflow
        .submit_run(RunRequest::new("Explain the plan"))
        .await
        .unwrap();

    let finished = wait_for_terminal(&taskflow, &run.id).await;
    assert_eq!(finished.status, RunStatus::Completed);
    assert_eq!(
        finished.total_tokens,
        finished.total_prompt_tokens + finished.total_completion_tokens
    );
    assert!(finished.total_usd > 0.0);
    assert!(finished.started_at.is_some() && finished.ended_at.is_some());

    let steps = taskflow.list_steps(&run.id).await.unwrap();
    assert!(steps.len() >= 3);
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
    assert!(steps.iter().all(|s| s.attempts <= s.max_retries + 1));

    let events = taskflow
        .repository()
        .list_events(&run.id, None)
        .await
        .unwrap();
    assert_eq!(events.first().unwrap().event_type, EventType::RunCreated);
    assert_eq!(events.last().unwrap().event_type, EventType::RunFinished);
    assert_eq!(count_events(&events, EventType::PlanningStarted), 1);
    assert_eq!(count_events(&events, EventType::PlanningFinished), 1);
    assert!(count_events(&events, EventType::StepStarted) >= 3);
    assert!(count_events(&events, EventType::StepFinished) >= 3);

    // Events are totally ordered by (created_at, id).
    let mut sorted = events.clone();
    sorted.sort_by(|a, b| (&a.created_at, &a.id).cmp(&(&b.created_at, &b.id)));
    assert_eq!(events, sorted);

    // Every node's DAG state settled as well.
    let dag = finished.dag.unwrap();
    assert!(dag.nodes.iter().all(|n| n.status == StepStatus::Completed));
    assert!(dag.planner_notes.is_some());

    // The cost ledger has the planner call plus one row per step.
    let ledger = taskflow.list_cost_entries(&run.id).await.unwrap();
    assert_eq!(ledger.len(), 1 + steps.len());
    assert!(ledger.iter().any(|entry| entry.step_id.is_none()));
}

#[tokio::test]
async fn replay_then_tail_reproduces_the_stored_sequence() {
    let taskflow = Taskflow::start(Settings::default()).await.unwrap();
    let run = taskflow
        .submit_run(RunRequest::new("Replay me"))
        .await
        .unwrap();
    wait_for_terminal(&taskflow, &run.id).await;

    let stored = taskflow
        .repository()
        .list_events(&run.id, None)
        .await
        .unwrap();

    let mut feed = taskflow.events(&run.id).await.unwrap();
    let mut replayed = Vec::new();
    while let Some(event) = feed.next().await {
        let terminal = event.event_type.is_terminal();
        replayed.push(event);
        if terminal {
            break;
        }
    }
    assert_eq!(replayed, stored);
}

#[tokio::test]
async fn cancel_mid_flight_leaves_no_step_running() {
    let provider = Arc::new(MockProvider::with_latency(Duration::from_millis(200)));
    let taskflow = Taskflow::start_with_provider(Settings::default(), provider)
        .await
        .unwrap();

    let run = taskflow
        .submit_run(RunRequest::new("Long running task for cancellation"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(taskflow.cancel_run(&run.id).await.unwrap());

    let finished = wait_for_terminal(&taskflow, &run.id).await;
    assert_eq!(finished.status, RunStatus::Canceled);
    assert!(!finished.cancel_requested);

    let steps = taskflow.list_steps(&run.id).await.unwrap();
    assert!(steps.iter().all(|s| s.status != StepStatus::Running));

    let events = taskflow
        .repository()
        .list_events(&run.id, None)
        .await
        .unwrap();
    let run_finished = events
        .iter()
        .find(|e| e.event_type == EventType::RunFinished)
        .unwrap();
    assert_eq!(run_finished.payload["reason"], "cancel_requested");
    assert_eq!(run_finished.payload["status"], "canceled");

    if let Some(dag) = finished.dag {
        assert!(dag.nodes.iter().all(|n| {
            n.status != StepStatus::Pending && n.status != StepStatus::Running
        }));
    }
}

#[tokio::test]
async fn budget_cutoff_fails_the_run() {
    let taskflow = Taskflow::start(Settings::default()).await.unwrap();
    let run = taskflow
        .submit_run(
            RunRequest::new("Budget bound run").with_constraints(RunConstraintOverrides {
                budget_usd: Some(0.00001),
                ..Default::default()
            }),
        )
        .await
        .unwrap();

    let finished = wait_for_terminal(&taskflow, &run.id).await;
    assert_eq!(finished.status, RunStatus::Failed);
    assert!(finished.total_usd >= 0.00001);

    let events = taskflow
        .repository()
        .list_events(&run.id, None)
        .await
        .unwrap();
    let run_finished = events
        .iter()
        .find(|e| e.event_type == EventType::RunFinished)
        .unwrap();
    assert_eq!(run_finished.payload["reason"], "budget_exceeded");
}

#[tokio::test]
async fn incomplete_runs_resume_on_restart() {
    use serde_json::json;
    use taskflow_runtime::persistence::{NewRun, Repository};

    let dir = tempfile::tempdir().unwrap();
    let url = format!(
        "sqlite://{}?mode=rwc",
        dir.path().join("taskflow.db").display()
    );

    // First process: the run row lands in the store, then the process dies
    // before any worker touches it.
    {
        let repo = Repository::connect(&url).await.unwrap();
        repo.create_run(&NewRun {
            id: "run-restart".to_string(),
            task: "Survive a restart".to_string(),
            template_id: None,
            constraints: RunConstraintOverrides::default(),
            metadata: json!({}),
        })
        .await
        .unwrap();
    }

    // Second process: startup picks the run up and drives it to terminal.
    let taskflow = Taskflow::start(Settings::default().with_database_url(&url))
        .await
        .unwrap();
    let finished = wait_for_terminal(&taskflow, "run-restart").await;
    assert_eq!(finished.status, RunStatus::Completed);
}

#[tokio::test]
async fn retry_after_failure_resets_and_reaches_terminal_again() {
    use std::collections::HashMap;
    use taskflow_kernel::StepContract;
    use taskflow_runtime::persistence::{TemplateGraph, TemplateNode, WorkflowTemplate};

    let taskflow = Taskflow::start(Settings::default()).await.unwrap();

    // Single-node template whose contract forbids the only tool, so the run
    // fails deterministically without burning retries.
    let mut contracts = HashMap::new();
    contracts.insert(
        "solo".to_string(),
        StepContract::default()
            .with_allowed_tools(vec![])
            .with_max_retries(0),
    );
    taskflow
        .repository()
        .upsert_template(&WorkflowTemplate {
            id: "template.failing.v1".to_string(),
            name: "Failing Template".to_string(),
            version: "1.0.0".to_string(),
            description: "Single node that cannot run its tool.".to_string(),
            graph: TemplateGraph {
                nodes: vec![TemplateNode {
                    id: "solo".to_string(),
                    name: "Solo".to_string(),
                    description: "only node".to_string(),
                    depends_on: vec![],
                }],
                edges: vec![],
            },
            contracts,
            created_at: None,
            updated_at: None,
        })
        .await
        .unwrap();

    let run = taskflow
        .submit_run(RunRequest::new("Doomed run").with_template("template.failing.v1"))
        .await
        .unwrap();

    let failed = wait_for_terminal(&taskflow, &run.id).await;
    assert_eq!(failed.status, RunStatus::Failed);
    let steps = taskflow.list_steps(&run.id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Failed);

    // Unknown step id is reported, not silently accepted.
    assert!(!taskflow.retry_run(&run.id, Some("ghost")).await.unwrap());

    assert!(taskflow.retry_run(&run.id, None).await.unwrap());
    let finished = wait_for_terminal(&taskflow, &run.id).await;
    assert_eq!(finished.status, RunStatus::Failed);

    let events = taskflow
        .repository()
        .list_events(&run.id, None)
        .await
        .unwrap();
    assert!(
        events
            .iter()
            .any(|e| e.event_type == EventType::RunRetryRequested)
    );
    // The retried attempt ran the step again from a clean slate.
    let steps = taskflow.list_steps(&run.id).await.unwrap();
    assert_eq!(steps[0].attempts, 1);
}
