//! Planner: instantiate a run DAG from a workflow template.

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use taskflow_kernel::{DagNode, DagSnapshot, EventType};

use super::OrchestratorError;
use crate::config::Settings;
use crate::events::EventEmitter;
use crate::llm::{CostEstimator, GenerateRequest, LLMProvider, ModelRouter, WorkloadType};
use crate::persistence::{NewCostEntry, Repository, RunRecord, RunUpdate, WorkflowTemplate};

/// Timeout for the single planning model call.
const PLANNING_TIMEOUT_S: u64 = 20;

pub struct PlannerService {
    repo: Arc<Repository>,
    settings: Arc<Settings>,
    provider: Arc<dyn LLMProvider>,
    router: ModelRouter,
    estimator: CostEstimator,
    emitter: Arc<EventEmitter>,
}

impl PlannerService {
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

    /// Produce the run's DAG. Idempotent: a run that already has nodes gets
    /// its existing DAG back untouched.
    pub async fn plan(
        &self,
        run: &RunRecord,
        request_id: &str,
    ) -> Result<DagSnapshot, OrchestratorError> {
        if let Some(dag) = &run.dag {
            if !dag.is_empty() {
                return Ok(dag.clone());
            }
        }

        self.emitter
            .emit(
                &run.id,
                None,
                EventType::PlanningStarted,
                json!({"task": run.task, "template_id": run.template_id}),
            )
            .await?;

        let template = self.select_template(run).await?;

        let planner_model = self.router.for_workload(WorkloadType::Planner);
        let planning_prompt = format!(
            "Create explicit execution checkpoints for this task and preserve contract semantics.\n\
             Task: {}\nTemplate: {}",
            run.task, template.name
        );
        let request = GenerateRequest::new(planning_prompt, planner_model.clone())
            .with_timeout_s(PLANNING_TIMEOUT_S)
            .with_meta("phase", "planner")
            .with_meta("run_id", run.id.clone())
            .with_meta("request_id", request_id.to_string());
        let response = self.provider.generate(request).await?;

        let cost = self.estimator.estimate(
            &planner_model,
            response.prompt_tokens,
            response.completion_tokens,
        );
        self.repo
            .create_cost_entry(&NewCostEntry {
                run_id: run.id.clone(),
                step_id: None,
                app: self.settings.cost_ledger_app.clone(),
                provider: response.provider.clone(),
                model: response.model.clone(),
                prompt_tokens: i64::from(cost.prompt_tokens),
                completion_tokens: i64::from(cost.completion_tokens),
                total_tokens: i64::from(cost.total_tokens),
                usd: cost.usd,
                metadata: json!({"phase": "planning", "request_id": request_id}),
            })
            .await?;
        self.repo
            .increment_run_totals(
                &run.id,
                i64::from(cost.prompt_tokens),
                i64::from(cost.completion_tokens),
                i64::from(cost.total_tokens),
                cost.usd,
            )
            .await?;

        let dag = instantiate(&template, response.content.clone());
        dag.validate()?;
        self.repo
            .update_run(&run.id, RunUpdate::new().dag(dag.clone()))
            .await?;

        info!(
            run_id = %run.id,
            template_id = %template.id,
            nodes = dag.nodes.len(),
            "planned run DAG"
        );
        self.emitter
            .emit(
                &run.id,
                None,
                EventType::PlanningFinished,
                json!({
                    "node_count": dag.nodes.len(),
                    "edge_count": dag.edges.len(),
                    "model": response.model,
                }),
            )
            .await?;

        Ok(dag)
    }

    /// Prefer the run's template; fall back to the most recently updated one.
    async fn select_template(&self, run: &RunRecord) -> Result<WorkflowTemplate, OrchestratorError> {
        if let Some(template_id) = &run.template_id {
            if let Some(template) = self.repo.get_template(template_id).await? {
                return Ok(template);
            }
        }
        self.repo
            .list_templates()
            .await?
            .into_iter()
            .next()
            .ok_or(OrchestratorError::NoTemplate)
    }
}

/// Deep-copy the template graph into a fresh DAG: every node pending, no
/// outputs, contracts carried over, planner notes attached.
fn instantiate(template: &WorkflowTemplate, planner_notes: String) -> DagSnapshot {
    let nodes = template
        .graph
        .nodes
        .iter()
        .map(|node| {
            let mut dag_node =
                DagNode::new(node.id.clone(), node.name.clone()).with_description(node.description.clone());
            dag_node.depends_on = node.depends_on.clone();
            dag_node
        })
        .collect();

    DagSnapshot {
        nodes,
        edges: template.graph.edges.clone(),
        contracts: template.contracts.clone(),
        planner_notes: Some(planner_notes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskflow_kernel::StepStatus;

    use crate::orchestration::templates::default_template;

    #[test]
    fn instantiate_stamps_pending_nodes_and_notes() {
        let dag = instantiate(&default_template(), "plan notes".to_string());
        assert_eq!(dag.nodes.len(), 3);
        assert!(dag.nodes.iter().all(|n| n.status == StepStatus::Pending));
        assert!(dag.nodes.iter().all(|n| n.last_output.is_none()));
        assert_eq!(dag.planner_notes.as_deref(), Some("plan notes"));
        assert_eq!(dag.contracts.len(), 3);
        assert!(dag.validate().is_ok());
    }
}
