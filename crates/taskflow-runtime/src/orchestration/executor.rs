//! Executor: run one DAG node per tick.
//!
//! A tick selects the first runnable node, invokes the model under the
//! contract's deadline, validates the output, and persists the outcome.
//! Failures go through the retry path: attempts up to `max_retries` put the
//! node back to pending after an exponential backoff; exhaustion marks it
//! failed and raises the reflection flag.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, warn};

use taskflow_kernel::{
    CostRecord, DagNode, EventType, FailureCode, FailureMode, ModelPreference, RunState,
    StepContract, StepStatus, StructuredError, new_id, utc_now_iso,
};

use super::OrchestratorError;
use super::contracts::validate_output;
use crate::config::Settings;
use crate::events::EventEmitter;
use crate::llm::{
    CostEstimate, CostEstimator, GenerateRequest, LLMError, LLMProvider, ModelRouter, WorkloadType,
};
use crate::persistence::{NewCostEntry, Repository, RunUpdate, StepRecord};

/// Backoff ceiling in seconds.
const MAX_BACKOFF_S: u64 = 8;

struct StepFailure {
    code: FailureCode,
    message: String,
    details: Value,
}

impl StepFailure {
    fn new(code: FailureCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
        }
    }

    fn into_structured(self) -> StructuredError {
        StructuredError::new(self.code, self.message).with_details(self.details)
    }
}

struct StepSuccess {
    output: Value,
    cost: CostEstimate,
    provider: String,
    model: String,
}

pub struct ExecutorService {
    repo: Arc<Repository>,
    settings: Arc<Settings>,
    provider: Arc<dyn LLMProvider>,
    router: ModelRouter,
    estimator: CostEstimator,
    emitter: Arc<EventEmitter>,
}

impl ExecutorService {
    pub fn new(
        repo: Arc<Repository>,
        settings: Arc<Settings>,
        provider: Arc<dyn LLMProvider>,
        router: ModelRouter,
        estimator: CostEstimator,
        emitter: Arc<EventEmitter>,
    ) -> Self {
        Self {
            repo,
            settings,
            provider,
            router,
            estimator,
            emitter,
        }
    }

    /// One executor tick. When no node is runnable, clears `progress_made`
    /// and returns; the monitor decides what that means.
    pub async fn execute_next(&self, state: &mut RunState) -> Result<(), OrchestratorError> {
        let Some(node_id) = state.dag.next_runnable().map(|n| n.id.clone()) else {
            state.progress_made = false;
            return Ok(());
        };
        state.progress_made = true;

        let contract = state.dag.contract(&node_id);
        let existing = self.repo.get_step_by_node(&state.run_id, &node_id).await?;
        let (step_id, attempts) = match &existing {
            Some(step) => (step.id.clone(), step.attempts + 1),
            None => (new_id(), 1),
        };
        let max_retries = contract.max_retries;
        let started_at = utc_now_iso();

        let node_snapshot = match state.dag.node_mut(&node_id) {
            Some(node) => {
                node.status = StepStatus::Running;
                node.clone()
            }
            None => {
                state.progress_made = false;
                return Ok(());
            }
        };

        self.repo
            .update_run(&state.run_id, RunUpdate::new().dag(state.dag.clone()))
            .await?;
        self.repo
            .upsert_step(&StepRecord {
                id: step_id.clone(),
                run_id: state.run_id.clone(),
                node_id: node_id.clone(),
                status: StepStatus::Running,
                attempts,
                max_retries,
                started_at: Some(started_at.clone()),
                ended_at: None,
                input: json!({
                    "task": state.task,
                    "node": node_snapshot,
                    "request_id": state.request_id,
                }),
                output: None,
                error: None,
                cost: None,
                logs: Vec::new(),
            })
            .await?;
        self.emitter
            .emit(
                &state.run_id,
                Some(&step_id),
                EventType::StepStarted,
                json!({"node_id": node_id, "attempt": attempts}),
            )
            .await?;

        let result = if !contract.allows("llm.generate") {
            Err(StepFailure::new(
                FailureCode::ToolNotAllowed,
                "Contract does not allow llm.generate",
                json!({"allowed_tools": contract.allowed_tools}),
            ))
        } else {
            // The one-shot reflection hint is consumed here: it steers this
            // tick only, then the contract preference applies again.
            let preference = state
                .reflection_model_preference
                .take()
                .unwrap_or(contract.model_preference);
            self.attempt(state, &node_snapshot, &contract, preference)
                .await
        };

        match result {
            Ok(success) => {
                self.record_success(state, &step_id, &node_id, attempts, max_retries, &started_at, success)
                    .await
            }
            Err(failure) => {
                self.handle_step_failure(
                    state,
                    &step_id,
                    &node_id,
                    attempts,
                    max_retries,
                    &started_at,
                    failure,
                )
                .await
            }
        }
    }

    /// Run the model call and validate its output. Pure with respect to
    /// persistence; all bookkeeping happens in the caller.
    async fn attempt(
        &self,
        state: &RunState,
        node: &DagNode,
        contract: &StepContract,
        preference: ModelPreference,
    ) -> Result<StepSuccess, StepFailure> {
        let model = self.router.for_step(preference, WorkloadType::Executor);
        let prompt = build_prompt(state, node);
        let request = GenerateRequest::new(prompt, model.clone())
            .with_timeout_s(contract.timeout_s)
            .with_meta("phase", "execute_step")
            .with_meta("run_id", state.run_id.clone())
            .with_meta("node_id", node.id.clone())
            .with_meta("request_id", state.request_id.clone());

        // Outer deadline fires even when the adapter ignores its timeout arg.
        let response = match tokio::time::timeout(
            Duration::from_secs(contract.timeout_s),
            self.provider.generate(request),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(LLMError::Timeout(raw))) => {
                return Err(StepFailure::new(
                    FailureCode::Timeout,
                    "Step execution timed out",
                    json!({"timeout_s": contract.timeout_s, "raw_error": raw}),
                ));
            }
            Ok(Err(err)) => {
                return Err(StepFailure::new(
                    FailureCode::ExecutionError,
                    "Unhandled execution error",
                    json!({"raw_error": err.to_string()}),
                ));
            }
            Err(elapsed) => {
                return Err(StepFailure::new(
                    FailureCode::Timeout,
                    "Step execution timed out",
                    json!({"timeout_s": contract.timeout_s, "raw_error": elapsed.to_string()}),
                ));
            }
        };

        let confidence = if preference == ModelPreference::Expensive {
            0.85
        } else {
            0.7
        };
        let output = json!({
            "summary": response.content,
            "confidence": confidence,
            "artifacts": {
                "model": response.model,
                "provider": response.provider,
                "node_id": node.id,
            },
        });
        let validated = validate_output(&node.id, &output).map_err(|message| {
            StepFailure::new(
                FailureCode::SchemaError,
                "Step output schema validation failed",
                json!({"validation_error": message}),
            )
        })?;

        let cost = self
            .estimator
            .estimate(&model, response.prompt_tokens, response.completion_tokens);

        Ok(StepSuccess {
            output: validated,
            cost,
            provider: response.provider,
            model,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_success(
        &self,
        state: &mut RunState,
        step_id: &str,
        node_id: &str,
        attempts: u32,
        max_retries: u32,
        started_at: &str,
        success: StepSuccess,
    ) -> Result<(), OrchestratorError> {
        let ended_at = utc_now_iso();
        let cost_record = CostRecord {
            provider: success.provider.clone(),
            model: success.model.clone(),
            prompt_tokens: success.cost.prompt_tokens,
            completion_tokens: success.cost.completion_tokens,
            total_tokens: success.cost.total_tokens,
            usd: success.cost.usd,
        };
        let cost_payload = serde_json::to_value(&cost_record)
            .unwrap_or(Value::Object(serde_json::Map::new()));

        let node_snapshot = state.dag.node(node_id).cloned();
        self.repo
            .upsert_step(&StepRecord {
                id: step_id.to_string(),
                run_id: state.run_id.clone(),
                node_id: node_id.to_string(),
                status: StepStatus::Completed,
                attempts,
                max_retries,
                started_at: Some(started_at.to_string()),
                ended_at: Some(ended_at),
                input: json!({
                    "task": state.task,
                    "node": node_snapshot,
                    "request_id": state.request_id,
                }),
                output: Some(success.output.clone()),
                error: None,
                cost: Some(cost_record),
                logs: Vec::new(),
            })
            .await?;
        self.repo
            .create_cost_entry(&NewCostEntry {
                run_id: state.run_id.clone(),
                step_id: Some(step_id.to_string()),
                app: self.settings.cost_ledger_app.clone(),
                provider: success.provider.clone(),
                model: success.model.clone(),
                prompt_tokens: i64::from(success.cost.prompt_tokens),
                completion_tokens: i64::from(success.cost.completion_tokens),
                total_tokens: i64::from(success.cost.total_tokens),
                usd: success.cost.usd,
                metadata: json!({
                    "phase": "step_execution",
                    "node_id": node_id,
                    "attempt": attempts,
                    "request_id": state.request_id,
                }),
            })
            .await?;
        self.repo
            .increment_run_totals(
                &state.run_id,
                i64::from(success.cost.prompt_tokens),
                i64::from(success.cost.completion_tokens),
                i64::from(success.cost.total_tokens),
                success.cost.usd,
            )
            .await?;

        if let Some(node) = state.dag.node_mut(node_id) {
            node.status = StepStatus::Completed;
            node.last_output = Some(success.output);
            node.last_error = None;
        }
        self.repo
            .update_run(&state.run_id, RunUpdate::new().dag(state.dag.clone()))
            .await?;
        state.step_counter += 1;

        debug!(run_id = %state.run_id, node_id, attempts, "step completed");
        self.emitter
            .emit(
                &state.run_id,
                Some(step_id),
                EventType::StepFinished,
                json!({"node_id": node_id, "cost": cost_payload}),
            )
            .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_step_failure(
        &self,
        state: &mut RunState,
        step_id: &str,
        node_id: &str,
        attempts: u32,
        max_retries: u32,
        started_at: &str,
        failure: StepFailure,
    ) -> Result<(), OrchestratorError> {
        let code = failure.code;
        let structured = failure.into_structured();
        let ended_at = utc_now_iso();
        // Retry ticks count against the step budget: reflection cadence and
        // max-steps bound total work including retries.
        state.step_counter += 1;

        if attempts <= max_retries {
            let backoff_s = 2u64.saturating_pow(attempts.saturating_sub(1)).min(MAX_BACKOFF_S);
            let node_snapshot = {
                let node = state.dag.node_mut(node_id);
                if let Some(node) = node {
                    node.status = StepStatus::Pending;
                    node.last_error = Some(structured.clone());
                }
                state.dag.node(node_id).cloned()
            };
            self.repo
                .upsert_step(&StepRecord {
                    id: step_id.to_string(),
                    run_id: state.run_id.clone(),
                    node_id: node_id.to_string(),
                    status: StepStatus::Pending,
                    attempts,
                    max_retries,
                    started_at: Some(started_at.to_string()),
                    ended_at: Some(ended_at),
                    input: json!({"task": state.task, "node": node_snapshot}),
                    output: None,
                    error: Some(structured.clone()),
                    cost: None,
                    logs: Vec::new(),
                })
                .await?;
            self.repo
                .update_run(&state.run_id, RunUpdate::new().dag(state.dag.clone()))
                .await?;

            warn!(
                run_id = %state.run_id,
                node_id,
                attempt = attempts,
                backoff_s,
                code = %code,
                "step attempt failed; retry scheduled"
            );
            self.emitter
                .emit(
                    &state.run_id,
                    Some(step_id),
                    EventType::StepRetryScheduled,
                    json!({
                        "node_id": node_id,
                        "attempt": attempts,
                        "max_retries": max_retries,
                        "backoff_s": backoff_s,
                        "error": structured,
                    }),
                )
                .await?;
            tokio::time::sleep(Duration::from_secs(backoff_s)).await;
            return Ok(());
        }

        let node_snapshot = {
            if let Some(node) = state.dag.node_mut(node_id) {
                node.status = StepStatus::Failed;
                node.last_error = Some(structured.clone());
            }
            state.dag.node(node_id).cloned()
        };
        self.repo
            .upsert_step(&StepRecord {
                id: step_id.to_string(),
                run_id: state.run_id.clone(),
                node_id: node_id.to_string(),
                status: StepStatus::Failed,
                attempts,
                max_retries,
                started_at: Some(started_at.to_string()),
                ended_at: Some(ended_at),
                input: json!({"task": state.task, "node": node_snapshot}),
                output: None,
                error: Some(structured.clone()),
                cost: None,
                logs: Vec::new(),
            })
            .await?;
        self.repo
            .update_run(&state.run_id, RunUpdate::new().dag(state.dag.clone()))
            .await?;

        state.request_reflection(
            format!("Step {node_id} failed"),
            FailureMode::from_failure_code(code),
        );

        warn!(
            run_id = %state.run_id,
            node_id,
            attempts,
            code = %code,
            "step failed; retries exhausted"
        );
        self.emitter
            .emit(
                &state.run_id,
                Some(step_id),
                EventType::StepFailed,
                json!({"node_id": node_id, "error": structured}),
            )
            .await?;
        Ok(())
    }
}

/// Prompt assembled from the task, the node, and upstream outputs.
fn build_prompt(state: &RunState, node: &DagNode) -> String {
    let completed: Vec<Value> = state
        .dag
        .nodes
        .iter()
        .filter(|n| n.last_output.is_some())
        .map(|n| json!({"node_id": n.id, "output": n.last_output}))
        .collect();

    format!(
        "Task: {}\nNode: {}\nDescription: {}\nCompleted upstream outputs: {}",
        state.task,
        node.id,
        node.description,
        Value::Array(completed)
    )
}
