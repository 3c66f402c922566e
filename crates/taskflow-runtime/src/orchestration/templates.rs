//! Built-in workflow templates, seeded at startup.

use std::collections::HashMap;

use taskflow_kernel::{DagEdge, ModelPreference, StepContract};

use crate::persistence::{TemplateGraph, TemplateNode, WorkflowTemplate};

pub const DEFAULT_TEMPLATE_ID: &str = "template.default.v1";

/// Baseline linear DAG: understand → execute → synthesize.
pub fn default_template() -> WorkflowTemplate {
    let graph = TemplateGraph {
        nodes: vec![
            TemplateNode {
                id: "understand_task".to_string(),
                name: "Understand Task".to_string(),
                description: "Clarify objective, constraints, and success criteria.".to_string(),
                depends_on: vec![],
            },
            TemplateNode {
                id: "execute_task".to_string(),
                name: "Execute Task".to_string(),
                description: "Perform core execution work to satisfy the user request."
                    .to_string(),
                depends_on: vec!["understand_task".to_string()],
            },
            TemplateNode {
                id: "synthesize_results".to_string(),
                name: "Synthesize Results".to_string(),
                description: "Assemble outputs into final response artifacts.".to_string(),
                depends_on: vec!["execute_task".to_string()],
            },
        ],
        edges: vec![
            DagEdge::new("understand_task", "execute_task"),
            DagEdge::new("execute_task", "synthesize_results"),
        ],
    };

    let mut contracts = HashMap::new();
    contracts.insert(
        "understand_task".to_string(),
        StepContract::with_preference(ModelPreference::Cheap).with_max_retries(1),
    );
    contracts.insert(
        "execute_task".to_string(),
        StepContract::with_preference(ModelPreference::Default).with_max_retries(2),
    );
    contracts.insert(
        "synthesize_results".to_string(),
        StepContract::with_preference(ModelPreference::Expensive).with_max_retries(1),
    );

    WorkflowTemplate {
        id: DEFAULT_TEMPLATE_ID.to_string(),
        name: "Default Taskflow Template".to_string(),
        version: "1.0.0".to_string(),
        description: "A baseline linear DAG for planning, execution, and synthesis.".to_string(),
        graph,
        contracts,
        created_at: None,
        updated_at: None,
    }
}

/// Templates installed on startup.
pub fn seed_templates() -> Vec<WorkflowTemplate> {
    vec![default_template()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_template_is_a_three_node_chain() {
        let template = default_template();
        assert_eq!(template.id, DEFAULT_TEMPLATE_ID);
        assert_eq!(template.graph.nodes.len(), 3);
        assert_eq!(template.graph.edges.len(), 2);
        assert_eq!(template.contracts.len(), 3);
        assert_eq!(
            template.contracts["synthesize_results"].model_preference,
            ModelPreference::Expensive
        );
        assert_eq!(template.contracts["execute_task"].max_retries, 2);
    }
}
