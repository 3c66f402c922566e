//! DAG snapshot: the executable graph embedded in a run.
//!
//! Nodes carry their own runtime status so the snapshot serialized into the
//! run row is a complete picture of progress. Contracts attach per-node
//! execution policy. Edges are kept explicitly (alongside `depends_on`) so
//! skip propagation can walk the graph forward.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::model::{StepStatus, StructuredError};

// ---------------------------------------------------------------------------
// Model preference
// ---------------------------------------------------------------------------

/// Which pricing tier a step asks for.
///
/// Anything the contract author wrote that is not one of the three known
/// tiers deserializes to `Unspecified` and falls back to the workload default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelPreference {
    Cheap,
    #[default]
    Default,
    Expensive,
    #[serde(other)]
    Unspecified,
}

// ---------------------------------------------------------------------------
// Step contract
// ---------------------------------------------------------------------------

fn default_allowed_tools() -> Vec<String> {
    vec!["llm.generate".to_string()]
}

fn default_timeout_s() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    2
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Per-node execution policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepContract {
    #[serde(default = "default_allowed_tools")]
    pub allowed_tools: Vec<String>,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub model_preference: ModelPreference,
    #[serde(default = "empty_object")]
    pub expected_output_schema: Value,
}

impl Default for StepContract {
    fn default() -> Self {
        Self {
            allowed_tools: default_allowed_tools(),
            timeout_s: default_timeout_s(),
            max_retries: default_max_retries(),
            model_preference: ModelPreference::Default,
            expected_output_schema: empty_object(),
        }
    }
}

impl StepContract {
    /// Contract with the given model preference, other fields default.
    pub fn with_preference(preference: ModelPreference) -> Self {
        Self {
            model_preference: preference,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_allowed_tools(mut self, tools: Vec<String>) -> Self {
        self.allowed_tools = tools;
        self
    }

    pub fn with_timeout_s(mut self, timeout_s: u64) -> Self {
        self.timeout_s = timeout_s;
        self
    }

    pub fn allows(&self, tool: &str) -> bool {
        self.allowed_tools.iter().any(|t| t == tool)
    }
}

// ---------------------------------------------------------------------------
// Nodes and edges
// ---------------------------------------------------------------------------

/// One executable node of the run DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagNode {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub last_output: Option<Value>,
    #[serde(default)]
    pub last_error: Option<StructuredError>,
}

impl DagNode {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            depends_on: Vec::new(),
            status: StepStatus::Pending,
            last_output: None,
            last_error: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn depends_on(mut self, node_id: impl Into<String>) -> Self {
        self.depends_on.push(node_id.into());
        self
    }

    /// Reset to a runnable state, clearing any prior outcome.
    pub fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.last_output = None;
        self.last_error = None;
    }
}

/// Directed edge, source → target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagEdge {
    pub source: String,
    pub target: String,
}

impl DagEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Validation failures for a DAG snapshot.
#[derive(Debug, thiserror::Error)]
pub enum DagError {
    #[error("duplicate node id: {0}")]
    DuplicateNode(String),
    #[error("node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency { node: String, dependency: String },
    #[error("edge references unknown node: {0}")]
    UnknownEdgeEndpoint(String),
    #[error("dependency graph contains a cycle")]
    Cycle,
}

/// The full graph embedded in a run: nodes, edges, contracts, planner notes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DagSnapshot {
    #[serde(default)]
    pub nodes: Vec<DagNode>,
    #[serde(default)]
    pub edges: Vec<DagEdge>,
    #[serde(default)]
    pub contracts: HashMap<String, StepContract>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planner_notes: Option<String>,
}

impl DagSnapshot {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&DagNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut DagNode> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    pub fn contract(&self, node_id: &str) -> StepContract {
        self.contracts.get(node_id).cloned().unwrap_or_default()
    }

    /// First pending node (in declaration order) whose dependencies are all
    /// completed. This is the executor's selection rule.
    pub fn next_runnable(&self) -> Option<&DagNode> {
        let by_id: HashMap<&str, &DagNode> =
            self.nodes.iter().map(|n| (n.id.as_str(), n)).collect();
        self.nodes.iter().find(|node| {
            node.status == StepStatus::Pending
                && node.depends_on.iter().all(|dep| {
                    by_id
                        .get(dep.as_str())
                        .map(|d| d.status == StepStatus::Completed)
                        .unwrap_or(false)
                })
        })
    }

    pub fn has_runnable(&self) -> bool {
        self.next_runnable().is_some()
    }

    pub fn any_with_status(&self, status: StepStatus) -> bool {
        self.nodes.iter().any(|n| n.status == status)
    }

    /// All nodes settled in {completed, skipped} and the node set is non-empty.
    pub fn all_settled_success(&self) -> bool {
        !self.nodes.is_empty() && self.nodes.iter().all(|n| n.status.is_settled_success())
    }

    /// Transitive descendants of `roots`, forward BFS over edges.
    /// The returned set includes the roots themselves.
    pub fn descendants_of(&self, roots: &HashSet<String>) -> HashSet<String> {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &self.edges {
            adjacency
                .entry(edge.source.as_str())
                .or_default()
                .push(edge.target.as_str());
        }

        let mut seen: HashSet<String> = roots.clone();
        let mut queue: VecDeque<String> = roots.iter().cloned().collect();
        while let Some(current) = queue.pop_front() {
            if let Some(children) = adjacency.get(current.as_str()) {
                for &child in children {
                    if seen.insert(child.to_string()) {
                        queue.push_back(child.to_string());
                    }
                }
            }
        }
        seen
    }

    /// Validate structural invariants: unique node ids, dependencies and edge
    /// endpoints reference existing nodes, and the graph is acyclic.
    pub fn validate(&self) -> Result<(), DagError> {
        let ids: HashSet<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        if ids.len() != self.nodes.len() {
            let mut seen = HashSet::new();
            for node in &self.nodes {
                if !seen.insert(node.id.as_str()) {
                    return Err(DagError::DuplicateNode(node.id.clone()));
                }
            }
        }

        for node in &self.nodes {
            for dep in &node.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(DagError::UnknownDependency {
                        node: node.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        for edge in &self.edges {
            if !ids.contains(edge.source.as_str()) {
                return Err(DagError::UnknownEdgeEndpoint(edge.source.clone()));
            }
            if !ids.contains(edge.target.as_str()) {
                return Err(DagError::UnknownEdgeEndpoint(edge.target.clone()));
            }
        }

        self.check_acyclic()
    }

    // Kahn's algorithm over depends_on; a leftover node means a cycle.
    fn check_acyclic(&self) -> Result<(), DagError> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for node in &self.nodes {
            in_degree.entry(node.id.as_str()).or_insert(0);
            for dep in &node.depends_on {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(node.id.as_str());
                *in_degree.entry(node.id.as_str()).or_insert(0) += 1;
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();

        let mut visited = 0usize;
        while let Some(node) = queue.pop_front() {
            visited += 1;
            if let Some(children) = dependents.get(node) {
                for &child in children {
                    let deg = in_degree.get_mut(child).ok_or(DagError::Cycle)?;
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(child);
                    }
                }
            }
        }

        if visited != self.nodes.len() {
            return Err(DagError::Cycle);
        }
        Ok(())
    }
}
