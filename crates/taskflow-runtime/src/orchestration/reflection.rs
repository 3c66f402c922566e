//! Reflection: turn a failure mode into a decision.
//!
//! Invoked only when the reflection flag is up. Timeouts and budget risk
//! terminate the run; schema errors replan by skipping the failed subtree;
//! low confidence upgrades the next executor tick to the expensive tier.
//! Every pass appends a diagnostic and emits a `reflection` event.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use tracing::info;

use taskflow_kernel::{
    DagSnapshot, Diagnostic, EventType, FailureCode, FailureMode, ModelPreference,
    ReflectionAction, RunState, RunStatus, StepStatus, StructuredError,
};

use super::OrchestratorError;
use crate::events::EventEmitter;
use crate::persistence::Repository;

pub struct ReflectionService {
    repo: Arc<Repository>,
    emitter: Arc<EventEmitter>,
}

impl ReflectionService {
    pub fn new(repo: Arc<Repository>, emitter: Arc<EventEmitter>) -> Self {
        Self { repo, emitter }
    }

    pub async fn reflect(&self, state: &mut RunState) -> Result<(), OrchestratorError> {
        if !state.reflection_needed {
            return Ok(());
        }

        let reason = state
            .reflection_reason
            .clone()
            .unwrap_or_else(|| "Reflection requested".to_string());
        let failure_mode = state.failure_mode.unwrap_or(FailureMode::Other);
        let action = decide_action(failure_mode);

        match action {
            ReflectionAction::Replanned => {
                skip_failed_descendants(&mut state.dag);
                self.emitter
                    .emit(
                        &state.run_id,
                        None,
                        EventType::Replanned,
                        json!({"reason": reason, "failure_mode": failure_mode}),
                    )
                    .await?;
            }
            ReflectionAction::AdjustedParameters => {
                state.reflection_model_preference = Some(ModelPreference::Expensive);
            }
            ReflectionAction::Terminated => {
                state.should_finish = true;
                if !matches!(
                    state.finish_status,
                    Some(RunStatus::Failed) | Some(RunStatus::Canceled)
                ) {
                    state.finish_status = Some(RunStatus::Failed);
                    state.finish_reason = Some("reflection_terminated".to_string());
                }
            }
        }

        let diagnostic = Diagnostic {
            reason,
            failure_mode,
            action_taken: action,
        };
        self.repo
            .append_diagnostic(&state.run_id, diagnostic.clone())
            .await?;

        info!(
            run_id = %state.run_id,
            failure_mode = %failure_mode,
            action = %action,
            "reflection decision"
        );
        self.emitter
            .emit(
                &state.run_id,
                None,
                EventType::Reflection,
                serde_json::to_value(&diagnostic).unwrap_or_else(|_| json!({})),
            )
            .await?;

        state.clear_reflection();
        Ok(())
    }
}

/// Failure mode → action mapping.
fn decide_action(failure_mode: FailureMode) -> ReflectionAction {
    match failure_mode {
        FailureMode::Timeout | FailureMode::BudgetRisk => ReflectionAction::Terminated,
        FailureMode::SchemaError => ReflectionAction::Replanned,
        FailureMode::LowConfidence => ReflectionAction::AdjustedParameters,
        FailureMode::Other => ReflectionAction::Terminated,
    }
}

/// Skip every pending transitive descendant of the failed nodes.
fn skip_failed_descendants(dag: &mut DagSnapshot) {
    let failed_ids: HashSet<String> = dag
        .nodes
        .iter()
        .filter(|n| n.status == StepStatus::Failed)
        .map(|n| n.id.clone())
        .collect();
    if failed_ids.is_empty() {
        return;
    }

    let reachable = dag.descendants_of(&failed_ids);
    let mut upstream: Vec<String> = failed_ids.into_iter().collect();
    upstream.sort();

    for node in &mut dag.nodes {
        if reachable.contains(&node.id) && node.status == StepStatus::Pending {
            node.status = StepStatus::Skipped;
            node.last_error = Some(
                StructuredError::new(
                    FailureCode::ExecutionError,
                    "Skipped due to upstream failure during replanning",
                )
                .with_details(json!({"upstream": upstream})),
            );
        }
    }
}
