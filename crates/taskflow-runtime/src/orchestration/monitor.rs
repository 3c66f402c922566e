//! Monitor: decide what the loop does next.
//!
//! A pure function over the in-memory state and a fresh run record; it
//! writes nothing itself (the orchestrator persists the DAG after each
//! evaluation). Checks run in strict precedence: first match wins.

use tracing::debug;

use taskflow_kernel::{FailureMode, RunState, RunStatus, StepStatus};

use crate::persistence::RunRecord;

#[derive(Debug, Default)]
pub struct MonitorService;

impl MonitorService {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate termination, budget, deadline, deadlock, and the periodic
    /// reflection trigger. `run` is the freshly fetched record; `None` means
    /// the run vanished from the store.
    pub fn evaluate(&self, state: &mut RunState, run: Option<&RunRecord>) {
        let Some(run) = run else {
            state.finish(RunStatus::Failed, "run_missing");
            return;
        };

        if run.cancel_requested {
            state.finish(RunStatus::Canceled, "cancel_requested");
            return;
        }

        if state.elapsed_s() >= state.constraints.timeout_s {
            state.finish(RunStatus::Failed, "timeout");
            state.request_reflection("Run timeout exceeded", FailureMode::Timeout);
            return;
        }

        if run.total_usd >= state.constraints.budget_usd {
            state.finish(RunStatus::Failed, "budget_exceeded");
            state.request_reflection("Budget cap exceeded", FailureMode::BudgetRisk);
            return;
        }

        if state.dag.all_settled_success() {
            state.finish(RunStatus::Completed, "all_steps_completed");
            return;
        }

        let has_running = state.dag.any_with_status(StepStatus::Running);
        let has_pending = state.dag.any_with_status(StepStatus::Pending);

        if !state.dag.has_runnable() && has_pending && !has_running {
            state.finish(RunStatus::Failed, "dependency_deadlock");
            state.reflection_needed = true;
            state.reflection_reason =
                Some("No runnable steps due to unmet dependencies".to_string());
            state.failure_mode = state.failure_mode.or(Some(FailureMode::Other));
            return;
        }

        if !has_pending && !has_running && state.dag.any_with_status(StepStatus::Failed) {
            state.finish(RunStatus::Failed, "steps_failed");
            state.reflection_needed = true;
            state.reflection_reason = Some("One or more steps failed".to_string());
            state.failure_mode = state.failure_mode.or(Some(FailureMode::Other));
            return;
        }

        if state.step_counter >= state.constraints.max_steps {
            state.finish(RunStatus::Failed, "max_steps_exceeded");
            state.request_reflection("Max steps exceeded", FailureMode::Other);
            return;
        }

        let interval = state.constraints.reflection_interval_steps;
        if interval > 0
            && state.step_counter > 0
            && state.step_counter % interval == 0
            && state.progress_made
        {
            debug!(
                run_id = %state.run_id,
                step_counter = state.step_counter,
                "periodic reflection boundary"
            );
            state.reflection_needed = true;
            state.reflection_reason = Some("Periodic reflection boundary reached".to_string());
            state.failure_mode = state.failure_mode.or(Some(FailureMode::LowConfidence));
            state.progress_made = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskflow_kernel::{DagNode, DagSnapshot, RunConstraints};

    use crate::persistence::RunRecord;

    fn run_record(run_id: &str) -> RunRecord {
        RunRecord {
            id: run_id.to_string(),
            task: "t".to_string(),
            template_id: None,
            status: RunStatus::Running,
            constraints: Default::default(),
            dag: None,
            diagnostics: Vec::new(),
            created_at: taskflow_kernel::utc_now_iso(),
            started_at: None,
            ended_at: None,
            total_prompt_tokens: 0,
            total_completion_tokens: 0,
            total_tokens: 0,
            total_usd: 0.0,
            cancel_requested: false,
            metadata: json!({}),
        }
    }

    fn state_with_nodes(statuses: &[(&str, StepStatus)]) -> RunState {
        let mut dag = DagSnapshot::default();
        for (id, status) in statuses {
            let mut node = DagNode::new(*id, *id);
            node.status = *status;
            dag.nodes.push(node);
        }
        RunState::new("run-1", "t", RunConstraints::default(), "req").with_dag(dag)
    }

    #[test]
    fn missing_run_finishes_failed() {
        let mut state = state_with_nodes(&[("a", StepStatus::Pending)]);
        MonitorService::new().evaluate(&mut state, None);
        assert_eq!(state.finish_status, Some(RunStatus::Failed));
        assert_eq!(state.finish_reason.as_deref(), Some("run_missing"));
    }

    #[test]
    fn cancel_beats_every_other_check() {
        let mut state = state_with_nodes(&[("a", StepStatus::Completed)]);
        state.constraints.timeout_s = 0; // timeout would also fire
        let mut run = run_record("run-1");
        run.cancel_requested = true;
        run.total_usd = 100.0; // budget would also fire

        MonitorService::new().evaluate(&mut state, Some(&run));
        assert_eq!(state.finish_status, Some(RunStatus::Canceled));
        assert_eq!(state.finish_reason.as_deref(), Some("cancel_requested"));
        assert!(!state.reflection_needed);
    }

    #[test]
    fn timeout_sets_reflection_with_timeout_mode() {
        let mut state = state_with_nodes(&[("a", StepStatus::Pending)]);
        state.constraints.timeout_s = 0;
        MonitorService::new().evaluate(&mut state, Some(&run_record("run-1")));
        assert_eq!(state.finish_reason.as_deref(), Some("timeout"));
        assert!(state.reflection_needed);
        assert_eq!(state.failure_mode, Some(FailureMode::Timeout));
    }

    #[test]
    fn budget_exceeded_flags_budget_risk() {
        let mut state = state_with_nodes(&[("a", StepStatus::Pending)]);
        state.constraints.budget_usd = 0.00001;
        let mut run = run_record("run-1");
        run.total_usd = 0.00001;

        MonitorService::new().evaluate(&mut state, Some(&run));
        assert_eq!(state.finish_reason.as_deref(), Some("budget_exceeded"));
        assert_eq!(state.failure_mode, Some(FailureMode::BudgetRisk));
    }

    #[test]
    fn all_settled_completes_the_run() {
        let mut state =
            state_with_nodes(&[("a", StepStatus::Completed), ("b", StepStatus::Skipped)]);
        MonitorService::new().evaluate(&mut state, Some(&run_record("run-1")));
        assert_eq!(state.finish_status, Some(RunStatus::Completed));
        assert_eq!(state.finish_reason.as_deref(), Some("all_steps_completed"));
    }

    #[test]
    fn empty_dag_does_not_complete() {
        let mut state = state_with_nodes(&[]);
        MonitorService::new().evaluate(&mut state, Some(&run_record("run-1")));
        assert_ne!(state.finish_status, Some(RunStatus::Completed));
    }

    #[test]
    fn deadlock_is_pending_behind_failure_with_nothing_running() {
        let mut state = state_with_nodes(&[("a", StepStatus::Failed)]);
        let mut blocked = DagNode::new("b", "B").depends_on("a");
        blocked.status = StepStatus::Pending;
        state.dag.nodes.push(blocked);

        MonitorService::new().evaluate(&mut state, Some(&run_record("run-1")));
        assert_eq!(state.finish_reason.as_deref(), Some("dependency_deadlock"));
        assert!(state.reflection_needed);
        assert_eq!(state.failure_mode, Some(FailureMode::Other));
    }

    #[test]
    fn deadlock_preserves_existing_failure_mode() {
        let mut state = state_with_nodes(&[("a", StepStatus::Failed)]);
        let mut blocked = DagNode::new("b", "B").depends_on("a");
        blocked.status = StepStatus::Pending;
        state.dag.nodes.push(blocked);
        state.failure_mode = Some(FailureMode::SchemaError);

        MonitorService::new().evaluate(&mut state, Some(&run_record("run-1")));
        assert_eq!(state.failure_mode, Some(FailureMode::SchemaError));
    }

    #[test]
    fn exhausted_failures_finish_steps_failed() {
        let mut state =
            state_with_nodes(&[("a", StepStatus::Completed), ("b", StepStatus::Failed)]);
        MonitorService::new().evaluate(&mut state, Some(&run_record("run-1")));
        assert_eq!(state.finish_reason.as_deref(), Some("steps_failed"));
        assert!(state.reflection_needed);
    }

    #[test]
    fn max_steps_bound_fires_after_runnable_checks() {
        let mut state = state_with_nodes(&[("a", StepStatus::Pending)]);
        state.constraints.max_steps = 4;
        state.step_counter = 4;
        MonitorService::new().evaluate(&mut state, Some(&run_record("run-1")));
        assert_eq!(state.finish_reason.as_deref(), Some("max_steps_exceeded"));
        assert_eq!(state.failure_mode, Some(FailureMode::Other));
    }

    #[test]
    fn periodic_boundary_requests_reflection_and_clears_progress() {
        let mut state = state_with_nodes(&[("a", StepStatus::Pending)]);
        state.step_counter = 2;
        state.progress_made = true;

        MonitorService::new().evaluate(&mut state, Some(&run_record("run-1")));
        assert!(!state.should_finish);
        assert!(state.reflection_needed);
        assert_eq!(state.failure_mode, Some(FailureMode::LowConfidence));
        assert!(!state.progress_made);
    }

    #[test]
    fn periodic_boundary_needs_progress() {
        let mut state = state_with_nodes(&[("a", StepStatus::Pending)]);
        state.step_counter = 2;
        state.progress_made = false;

        MonitorService::new().evaluate(&mut state, Some(&run_record("run-1")));
        assert!(!state.reflection_needed);
    }

    #[test]
    fn evaluation_is_pure() {
        let make_state = || {
            let mut state =
                state_with_nodes(&[("a", StepStatus::Completed), ("b", StepStatus::Failed)]);
            state.step_counter = 3;
            state
        };
        let run = run_record("run-1");

        let mut first = make_state();
        let mut second = make_state();
        MonitorService::new().evaluate(&mut first, Some(&run));
        MonitorService::new().evaluate(&mut second, Some(&run));

        assert_eq!(first.finish_status, second.finish_status);
        assert_eq!(first.finish_reason, second.finish_reason);
        assert_eq!(first.reflection_needed, second.reflection_needed);
        assert_eq!(first.failure_mode, second.failure_mode);
    }
}
