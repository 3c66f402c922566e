//! Taskflow Kernel — data model and pure logic for the run orchestrator.
//!
//! This crate defines the vocabulary shared by every layer: run/step status
//! enums and the failure taxonomy, the DAG snapshot with its structural
//! validation, per-node step contracts, the in-memory run state threaded
//! through the control loop, and the run event model.
//!
//! Everything effectful (persistence, model providers, the orchestrator
//! itself) lives in `taskflow-runtime`.

pub mod clock;
pub mod dag;
pub mod event;
pub mod model;
pub mod state;

pub use clock::{new_id, utc_now_iso};
pub use dag::{DagEdge, DagError, DagNode, DagSnapshot, ModelPreference, StepContract};
pub use event::{EventType, RunEvent};
pub use model::{
    CostRecord, Diagnostic, FailureCode, FailureMode, ReflectionAction, RunStatus, StepStatus,
    StructuredError,
};
pub use state::{RunConstraintOverrides, RunConstraints, RunState};
