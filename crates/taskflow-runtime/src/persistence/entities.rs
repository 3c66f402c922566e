//! Persisted record types and update patches.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use taskflow_kernel::{
    CostRecord, DagEdge, DagSnapshot, Diagnostic, RunConstraintOverrides, RunStatus, StepContract,
    StepStatus, StructuredError,
};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// A run as stored in the `runs` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub task: String,
    pub template_id: Option<String>,
    pub status: RunStatus,
    pub constraints: RunConstraintOverrides,
    pub dag: Option<DagSnapshot>,
    pub diagnostics: Vec<Diagnostic>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub total_prompt_tokens: i64,
    pub total_completion_tokens: i64,
    pub total_tokens: i64,
    pub total_usd: f64,
    pub cancel_requested: bool,
    pub metadata: Value,
}

/// Fields for creating a run row. Everything else starts at its column default.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub id: String,
    pub task: String,
    pub template_id: Option<String>,
    pub constraints: RunConstraintOverrides,
    pub metadata: Value,
}

/// Partial update for a run row. JSON-shaped attributes are replaced
/// wholesale; `ended_at` can be cleared back to NULL (run retry).
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub started_at: Option<String>,
    pub ended_at: Option<Option<String>>,
    pub cancel_requested: Option<bool>,
    pub constraints: Option<RunConstraintOverrides>,
    pub dag: Option<DagSnapshot>,
    pub diagnostics: Option<Vec<Diagnostic>>,
    pub metadata: Option<Value>,
}

impl RunUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn started_at(mut self, at: impl Into<String>) -> Self {
        self.started_at = Some(at.into());
        self
    }

    pub fn ended_at(mut self, at: impl Into<String>) -> Self {
        self.ended_at = Some(Some(at.into()));
        self
    }

    pub fn clear_ended_at(mut self) -> Self {
        self.ended_at = Some(None);
        self
    }

    pub fn cancel_requested(mut self, flag: bool) -> Self {
        self.cancel_requested = Some(flag);
        self
    }

    pub fn dag(mut self, dag: DagSnapshot) -> Self {
        self.dag = Some(dag);
        self
    }

    pub fn diagnostics(mut self, diagnostics: Vec<Diagnostic>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.started_at.is_none()
            && self.ended_at.is_none()
            && self.cancel_requested.is_none()
            && self.constraints.is_none()
            && self.dag.is_none()
            && self.diagnostics.is_none()
            && self.metadata.is_none()
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// A step row, uniquely keyed by `(run_id, node_id)` and by its own id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: String,
    pub run_id: String,
    pub node_id: String,
    pub status: StepStatus,
    pub attempts: u32,
    pub max_retries: u32,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<StructuredError>,
    pub cost: Option<CostRecord>,
    pub logs: Vec<Value>,
}

// ---------------------------------------------------------------------------
// Cost ledger
// ---------------------------------------------------------------------------

/// One append-only cost ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEntry {
    pub id: String,
    pub run_id: String,
    pub step_id: Option<String>,
    pub app: String,
    pub provider: String,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub usd: f64,
    pub metadata: Value,
    pub created_at: String,
}

/// Ledger row before insertion (id and created_at are stamped by the store).
#[derive(Debug, Clone)]
pub struct NewCostEntry {
    pub run_id: String,
    pub step_id: Option<String>,
    pub app: String,
    pub provider: String,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub usd: f64,
    pub metadata: Value,
}

// ---------------------------------------------------------------------------
// Workflow templates
// ---------------------------------------------------------------------------

/// Structural node of a template graph; runtime status is stamped on when the
/// planner instantiates the run DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateNode {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Reusable (graph, contracts) pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateGraph {
    #[serde(default)]
    pub nodes: Vec<TemplateNode>,
    #[serde(default)]
    pub edges: Vec<DagEdge>,
}

/// A workflow template as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub graph: TemplateGraph,
    pub contracts: HashMap<String, StepContract>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_update_builder_tracks_emptiness() {
        assert!(RunUpdate::new().is_empty());
        assert!(!RunUpdate::new().status(RunStatus::Running).is_empty());
        assert!(!RunUpdate::new().clear_ended_at().is_empty());
    }

    #[test]
    fn template_graph_deserializes_without_runtime_fields() {
        let graph: TemplateGraph = serde_json::from_str(
            r#"{"nodes":[{"id":"a","name":"A"}],"edges":[{"source":"a","target":"a"}]}"#,
        )
        .unwrap();
        assert_eq!(graph.nodes[0].depends_on.len(), 0);
        assert_eq!(graph.edges.len(), 1);
    }
}
