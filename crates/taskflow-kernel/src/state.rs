//! In-memory run state carried through one control-loop worker.
//!
//! The state is a transient projection: the store stays authoritative and the
//! struct is rebuilt from it on resume. Exactly one component borrows it
//! mutably at a time (executor, monitor, reflection), so no interior locking
//! is needed.

use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::dag::{DagSnapshot, ModelPreference};
use crate::model::{FailureMode, RunStatus};

// ---------------------------------------------------------------------------
// Constraints
// ---------------------------------------------------------------------------

/// Fully resolved run bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunConstraints {
    pub budget_usd: f64,
    pub timeout_s: u64,
    pub max_steps: u64,
    pub reflection_interval_steps: u64,
}

impl Default for RunConstraints {
    fn default() -> Self {
        Self {
            budget_usd: 2.0,
            timeout_s: 300,
            max_steps: 30,
            reflection_interval_steps: 2,
        }
    }
}

/// Caller-supplied constraints; missing keys fall back to configured defaults
/// when the run worker starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConstraintOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection_interval_steps: Option<u64>,
}

impl RunConstraintOverrides {
    pub fn resolve(&self, defaults: &RunConstraints) -> RunConstraints {
        RunConstraints {
            budget_usd: self.budget_usd.unwrap_or(defaults.budget_usd),
            timeout_s: self.timeout_s.unwrap_or(defaults.timeout_s),
            max_steps: self.max_steps.unwrap_or(defaults.max_steps),
            reflection_interval_steps: self
                .reflection_interval_steps
                .unwrap_or(defaults.reflection_interval_steps),
        }
    }
}

impl From<RunConstraints> for RunConstraintOverrides {
    fn from(value: RunConstraints) -> Self {
        Self {
            budget_usd: Some(value.budget_usd),
            timeout_s: Some(value.timeout_s),
            max_steps: Some(value.max_steps),
            reflection_interval_steps: Some(value.reflection_interval_steps),
        }
    }
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// Mutable state threaded through plan → execute → monitor → reflect → finish.
#[derive(Debug, Clone)]
pub struct RunState {
    pub run_id: String,
    pub task: String,
    pub template_id: Option<String>,
    pub constraints: RunConstraints,
    pub dag: DagSnapshot,
    /// Total executor ticks consumed, retries included.
    pub step_counter: u64,
    pub progress_made: bool,
    pub reflection_needed: bool,
    pub reflection_reason: Option<String>,
    /// One-shot model hint set by reflection; the executor takes it on the
    /// next tick and it is gone.
    pub reflection_model_preference: Option<ModelPreference>,
    pub failure_mode: Option<FailureMode>,
    pub should_finish: bool,
    pub finish_status: Option<RunStatus>,
    pub finish_reason: Option<String>,
    /// Monotonic start of the run loop; wall-clock jumps do not abort runs.
    pub started: Instant,
    pub request_id: String,
}

impl RunState {
    pub fn new(
        run_id: impl Into<String>,
        task: impl Into<String>,
        constraints: RunConstraints,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            task: task.into(),
            template_id: None,
            constraints,
            dag: DagSnapshot::default(),
            step_counter: 0,
            progress_made: false,
            reflection_needed: false,
            reflection_reason: None,
            reflection_model_preference: None,
            failure_mode: None,
            should_finish: false,
            finish_status: None,
            finish_reason: None,
            started: Instant::now(),
            request_id: request_id.into(),
        }
    }

    pub fn with_template(mut self, template_id: Option<String>) -> Self {
        self.template_id = template_id;
        self
    }

    pub fn with_dag(mut self, dag: DagSnapshot) -> Self {
        self.dag = dag;
        self
    }

    /// Seconds elapsed since the worker started, on the monotonic clock.
    pub fn elapsed_s(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Mark the run for termination with the given status and reason.
    pub fn finish(&mut self, status: RunStatus, reason: impl Into<String>) {
        self.should_finish = true;
        self.finish_status = Some(status);
        self.finish_reason = Some(reason.into());
    }

    /// Raise the reflection flag with a reason and failure mode.
    pub fn request_reflection(&mut self, reason: impl Into<String>, mode: FailureMode) {
        self.reflection_needed = true;
        self.reflection_reason = Some(reason.into());
        self.failure_mode = Some(mode);
    }

    /// Clear reflection flags after a reflection pass.
    pub fn clear_reflection(&mut self) {
        self.reflection_needed = false;
        self.reflection_reason = None;
        self.failure_mode = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_fall_back_per_field() {
        let defaults = RunConstraints::default();
        let overrides = RunConstraintOverrides {
            budget_usd: Some(0.5),
            ..Default::default()
        };
        let resolved = overrides.resolve(&defaults);
        assert_eq!(resolved.budget_usd, 0.5);
        assert_eq!(resolved.timeout_s, defaults.timeout_s);
        assert_eq!(resolved.max_steps, defaults.max_steps);
    }

    #[test]
    fn empty_overrides_serialize_to_empty_object() {
        let json = serde_json::to_string(&RunConstraintOverrides::default()).unwrap();
        assert_eq!(json, "{}");
    }

    #[test]
    fn finish_sets_all_three_fields() {
        let mut state = RunState::new("r", "t", RunConstraints::default(), "req");
        state.finish(RunStatus::Failed, "budget_exceeded");
        assert!(state.should_finish);
        assert_eq!(state.finish_status, Some(RunStatus::Failed));
        assert_eq!(state.finish_reason.as_deref(), Some("budget_exceeded"));
    }
}
