//! The run control loop and its collaborating services.

pub mod contracts;
pub mod executor;
pub mod monitor;
pub mod orchestrator;
pub mod planner;
pub mod reflection;
pub mod templates;

pub use executor::ExecutorService;
pub use monitor::MonitorService;
pub use orchestrator::Orchestrator;
pub use planner::PlannerService;
pub use reflection::ReflectionService;

use crate::llm::LLMError;
use crate::persistence::PersistenceError;
use taskflow_kernel::DagError;

/// Failures that abort a run worker. Anything reaching the top of the loop
/// marks the run failed with reason `orchestrator_exception`; step-local
/// failures never surface here — the executor turns them into structured
/// step errors.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("llm error: {0}")]
    Llm(#[from] LLMError),
    #[error("invalid template graph: {0}")]
    InvalidTemplate(#[from] DagError),
    #[error("no workflow template available")]
    NoTemplate,
    #[error("workflow template not found: {0}")]
    TemplateNotFound(String),
    #[error("run not found: {0}")]
    RunNotFound(String),
}
