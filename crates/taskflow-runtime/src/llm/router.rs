//! Workload-based model selection.

use taskflow_kernel::ModelPreference;

use crate::config::Settings;
use std::sync::Arc;

/// What kind of work a model call is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadType {
    Planner,
    Executor,
    Reflection,
    Synthesis,
}

/// Maps workloads and per-step preferences to configured model ids.
#[derive(Debug, Clone)]
pub struct ModelRouter {
    settings: Arc<Settings>,
}

impl ModelRouter {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    /// Default model for a workload: planner goes cheap, reflection and
    /// synthesis go expensive, execution takes the default tier.
    pub fn for_workload(&self, workload: WorkloadType) -> String {
        match workload {
            WorkloadType::Planner => self.settings.llm_cheap_model.clone(),
            WorkloadType::Reflection | WorkloadType::Synthesis => {
                self.settings.llm_expensive_model.clone()
            }
            WorkloadType::Executor => self.settings.llm_default_model.clone(),
        }
    }

    /// Step-level preference wins; an unrecognized preference falls back to
    /// the workload default.
    pub fn for_step(&self, preference: ModelPreference, fallback: WorkloadType) -> String {
        match preference {
            ModelPreference::Cheap => self.settings.llm_cheap_model.clone(),
            ModelPreference::Default => self.settings.llm_default_model.clone(),
            ModelPreference::Expensive => self.settings.llm_expensive_model.clone(),
            ModelPreference::Unspecified => self.for_workload(fallback),
        }
    }
}
