//! The run control loop and worker registry.
//!
//! Each run is driven by a single background worker walking a five-node
//! cycle: plan → monitor, execute → monitor, reflect → monitor, with monitor
//! routing to execute, reflect, or finish. The worker registry guarantees
//! at most one live worker per run id in this process.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span};

use taskflow_kernel::{
    Diagnostic, EventType, FailureCode, FailureMode, ReflectionAction, RunState, RunStatus,
    StepStatus, StructuredError, utc_now_iso,
};

use super::executor::ExecutorService;
use super::monitor::MonitorService;
use super::planner::PlannerService;
use super::reflection::ReflectionService;
use super::OrchestratorError;
use crate::config::Settings;
use crate::events::{EventBroker, EventEmitter};
use crate::llm::{CostEstimator, LLMProvider, ModelRouter};
use crate::persistence::{PersistenceResult, Repository, RunUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopNode {
    Plan,
    Execute,
    Monitor,
    Reflect,
    Finish,
    End,
}

pub struct Orchestrator {
    repo: Arc<Repository>,
    settings: Arc<Settings>,
    planner: PlannerService,
    executor: ExecutorService,
    monitor: MonitorService,
    reflection: ReflectionService,
    emitter: Arc<EventEmitter>,
    workers: DashMap<String, JoinHandle<()>>,
}

impl Orchestrator {
    pub fn new(
        repo: Arc<Repository>,
        settings: Arc<Settings>,
        provider: Arc<dyn LLMProvider>,
        broker: Arc<EventBroker>,
    ) -> Self {
        let emitter = Arc::new(EventEmitter::new(Arc::clone(&repo), broker));
        let router = ModelRouter::new(Arc::clone(&settings));
        let estimator = CostEstimator::new(Arc::clone(&settings));

        let planner = PlannerService::new(
            Arc::clone(&repo),
            Arc::clone(&settings),
            Arc::clone(&provider),
            router.clone(),
            estimator.clone(),
            Arc::clone(&emitter),
        );
        let executor = ExecutorService::new(
            Arc::clone(&repo),
            Arc::clone(&settings),
            provider,
            router,
            estimator,
            Arc::clone(&emitter),
        );
        let reflection = ReflectionService::new(Arc::clone(&repo), Arc::clone(&emitter));

        Self {
            repo,
            settings,
            planner,
            executor,
            monitor: MonitorService::new(),
            reflection,
            emitter,
            workers: DashMap::new(),
        }
    }

    pub fn emitter(&self) -> Arc<EventEmitter> {
        Arc::clone(&self.emitter)
    }

    /// Ensure a single background worker for the run. A no-op while one is
    /// still live.
    pub fn start_run(self: &Arc<Self>, run_id: &str, request_id: &str) {
        let already_active = self
            .workers
            .get(run_id)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false);
        if already_active {
            return;
        }

        let this = Arc::clone(self);
        let run_id_owned = run_id.to_string();
        let request_id_owned = request_id.to_string();
        let span = info_span!("run_worker", run_id = %run_id_owned);

        let handle = tokio::spawn(
            async move {
                this.run_loop(&run_id_owned, &request_id_owned).await;
                this.workers.remove(&run_id_owned);
            }
            .instrument(span),
        );
        self.workers.insert(run_id.to_string(), handle);
    }

    /// Start a worker for every run left in {created, running} — called once
    /// at process start.
    pub async fn resume_incomplete_runs(self: &Arc<Self>) -> Result<usize, OrchestratorError> {
        let runs = self.repo.list_incomplete_runs().await?;
        let count = runs.len();
        for run in runs {
            self.start_run(&run.id, "resume");
        }
        if count > 0 {
            info!(count, "resumed incomplete runs");
        }
        Ok(count)
    }

    /// Flag the run for cooperative cancellation; the next monitor tick
    /// observes it.
    pub async fn request_cancel(&self, run_id: &str) -> PersistenceResult<()> {
        self.repo.request_cancel(run_id).await
    }

    /// Reset the named step (or every failed step) back to pending and
    /// restart the run. Returns `false` when the run or step is unknown.
    pub async fn retry_run(
        self: &Arc<Self>,
        run_id: &str,
        step_id: Option<&str>,
        request_id: &str,
    ) -> Result<bool, OrchestratorError> {
        let Some(run) = self.repo.get_run(run_id).await? else {
            return Ok(false);
        };
        let mut dag = run.dag.unwrap_or_default();

        match step_id {
            Some(step_id) => {
                if !self.repo.reset_step(run_id, step_id).await? {
                    return Ok(false);
                }
                if let Some(step) = self.repo.get_step(step_id).await? {
                    if let Some(node) = dag.node_mut(&step.node_id) {
                        node.reset();
                    }
                }
            }
            None => {
                self.repo.reset_failed_steps(run_id).await?;
                for node in &mut dag.nodes {
                    if node.status == StepStatus::Failed {
                        node.reset();
                    }
                }
            }
        }

        self.repo
            .update_run(
                run_id,
                RunUpdate::new()
                    .status(RunStatus::Running)
                    .clear_ended_at()
                    .cancel_requested(false)
                    .dag(dag),
            )
            .await?;
        self.emitter
            .emit(
                run_id,
                None,
                EventType::RunRetryRequested,
                json!({"step_id": step_id, "request_id": request_id}),
            )
            .await?;
        self.start_run(run_id, request_id);
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Worker body
    // -----------------------------------------------------------------------

    async fn run_loop(self: &Arc<Self>, run_id: &str, request_id: &str) {
        let run = match self.repo.get_run(run_id).await {
            Ok(Some(run)) => run,
            Ok(None) => return,
            Err(err) => {
                error!(run_id, error = %err, "failed to load run");
                return;
            }
        };
        if run.status.is_terminal() {
            return;
        }

        let started_at = run.started_at.clone().unwrap_or_else(utc_now_iso);
        if let Err(err) = self
            .repo
            .update_run(
                run_id,
                RunUpdate::new()
                    .status(RunStatus::Running)
                    .started_at(started_at.clone()),
            )
            .await
        {
            error!(run_id, error = %err, "failed to mark run running");
            return;
        }
        if let Err(err) = self
            .emitter
            .emit(
                run_id,
                None,
                EventType::RunStarted,
                json!({"request_id": request_id, "started_at": started_at}),
            )
            .await
        {
            error!(run_id, error = %err, "failed to emit run_started");
            return;
        }

        let constraints = run
            .constraints
            .resolve(&self.settings.default_constraints());
        let mut state = RunState::new(run_id, &run.task, constraints, request_id)
            .with_template(run.template_id.clone())
            .with_dag(run.dag.clone().unwrap_or_default());

        if let Err(err) = self.drive(&mut state).await {
            error!(run_id, error = %err, "run loop failed with unhandled error");
            let diagnostic = Diagnostic {
                reason: format!("Unhandled orchestrator error: {err}"),
                failure_mode: FailureMode::Other,
                action_taken: ReflectionAction::Terminated,
            };
            let _ = self
                .repo
                .update_run(
                    run_id,
                    RunUpdate::new()
                        .status(RunStatus::Failed)
                        .ended_at(utc_now_iso())
                        .diagnostics(vec![diagnostic]),
                )
                .await;
            let _ = self
                .emitter
                .emit(
                    run_id,
                    None,
                    EventType::RunFinished,
                    json!({"status": RunStatus::Failed, "reason": "orchestrator_exception"}),
                )
                .await;
        }
    }

    async fn drive(&self, state: &mut RunState) -> Result<(), OrchestratorError> {
        let mut current = LoopNode::Plan;
        while current != LoopNode::End {
            current = match current {
                LoopNode::Plan => {
                    self.plan_node(state).await?;
                    LoopNode::Monitor
                }
                LoopNode::Execute => {
                    self.executor.execute_next(state).await?;
                    LoopNode::Monitor
                }
                LoopNode::Monitor => {
                    let run = self.repo.get_run(&state.run_id).await?;
                    self.monitor.evaluate(state, run.as_ref());
                    self.repo
                        .update_run(&state.run_id, RunUpdate::new().dag(state.dag.clone()))
                        .await?;
                    if state.should_finish {
                        LoopNode::Finish
                    } else if state.reflection_needed {
                        LoopNode::Reflect
                    } else {
                        LoopNode::Execute
                    }
                }
                LoopNode::Reflect => {
                    self.reflection.reflect(state).await?;
                    self.repo
                        .update_run(&state.run_id, RunUpdate::new().dag(state.dag.clone()))
                        .await?;
                    LoopNode::Monitor
                }
                LoopNode::Finish => {
                    self.finish_node(state).await?;
                    LoopNode::End
                }
                LoopNode::End => LoopNode::End,
            };
        }
        Ok(())
    }

    async fn plan_node(&self, state: &mut RunState) -> Result<(), OrchestratorError> {
        let Some(run) = self.repo.get_run(&state.run_id).await? else {
            state.finish(RunStatus::Failed, "run_missing");
            return Ok(());
        };
        state.dag = self.planner.plan(&run, &state.request_id).await?;
        Ok(())
    }

    async fn finish_node(&self, state: &mut RunState) -> Result<(), OrchestratorError> {
        let status = state.finish_status.unwrap_or(RunStatus::Failed);
        let reason = state
            .finish_reason
            .clone()
            .unwrap_or_else(|| "unknown".to_string());

        if status == RunStatus::Canceled {
            self.cancel_open_work(state).await?;
        }

        self.repo
            .update_run(
                &state.run_id,
                RunUpdate::new()
                    .status(status)
                    .ended_at(utc_now_iso())
                    .cancel_requested(false)
                    .dag(state.dag.clone()),
            )
            .await?;

        info!(run_id = %state.run_id, status = %status, reason = %reason, "run finished");
        self.emitter
            .emit(
                &state.run_id,
                None,
                EventType::RunFinished,
                json!({"status": status, "reason": reason}),
            )
            .await?;
        Ok(())
    }

    /// On cancellation, no node or step may stay pending/running.
    async fn cancel_open_work(&self, state: &mut RunState) -> Result<(), OrchestratorError> {
        let cancel_error =
            StructuredError::new(FailureCode::Canceled, "Canceled by human override");

        for node in &mut state.dag.nodes {
            if matches!(node.status, StepStatus::Pending | StepStatus::Running) {
                node.status = StepStatus::Canceled;
                node.last_error = Some(cancel_error.clone());
            }
        }

        for step in self.repo.list_steps(&state.run_id).await? {
            if !matches!(step.status, StepStatus::Pending | StepStatus::Running) {
                continue;
            }
            let mut canceled = step;
            canceled.status = StepStatus::Canceled;
            canceled.ended_at = Some(utc_now_iso());
            canceled.error = Some(cancel_error.clone());
            self.repo.upsert_step(&canceled).await?;
        }
        Ok(())
    }
}
