//! Process-level wiring: build everything once, hand out references.
//!
//! The facade is what an HTTP layer (out of scope here) talks to: submit,
//! cancel, retry, inspect, and stream. Startup seeds the built-in template
//! and resumes any run left in {created, running} by a previous process.

use std::sync::Arc;

use serde_json::json;

use taskflow_kernel::{EventType, RunConstraintOverrides, new_id};

use crate::config::Settings;
use crate::events::{EventBroker, EventEmitter, EventStream, replay_then_tail};
use crate::llm::{LLMProvider, build_provider};
use crate::orchestration::templates::seed_templates;
use crate::orchestration::{Orchestrator, OrchestratorError};
use crate::persistence::{
    CostEntry, NewRun, PersistenceResult, Repository, RunRecord, StepRecord,
};

/// A run submission.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub task: String,
    pub template_id: Option<String>,
    pub constraints: RunConstraintOverrides,
    pub request_id: Option<String>,
}

impl RunRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            template_id: None,
            constraints: RunConstraintOverrides::default(),
            request_id: None,
        }
    }

    pub fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    pub fn with_constraints(mut self, constraints: RunConstraintOverrides) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// The assembled runtime.
pub struct Taskflow {
    settings: Arc<Settings>,
    repo: Arc<Repository>,
    broker: Arc<EventBroker>,
    emitter: Arc<EventEmitter>,
    orchestrator: Arc<Orchestrator>,
}

impl Taskflow {
    /// Build with the provider selected by settings.
    pub async fn start(settings: Settings) -> Result<Self, OrchestratorError> {
        let provider = build_provider(&settings)?;
        Self::start_with_provider(settings, provider).await
    }

    /// Build with an explicit provider (tests inject latency or failures).
    pub async fn start_with_provider(
        settings: Settings,
        provider: Arc<dyn LLMProvider>,
    ) -> Result<Self, OrchestratorError> {
        let settings = Arc::new(settings);
        let repo = Arc::new(Repository::connect(&settings.database_url).await?);
        for template in seed_templates() {
            repo.upsert_template(&template).await?;
        }

        let broker = Arc::new(EventBroker::new());
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&repo),
            Arc::clone(&settings),
            provider,
            Arc::clone(&broker),
        ));
        let emitter = orchestrator.emitter();

        let runtime = Self {
            settings,
            repo,
            broker,
            emitter,
            orchestrator,
        };
        runtime.orchestrator.resume_incomplete_runs().await?;
        Ok(runtime)
    }

    /// Create the run row, emit `run_created`, and start its worker.
    pub async fn submit_run(&self, request: RunRequest) -> Result<RunRecord, OrchestratorError> {
        if let Some(template_id) = &request.template_id {
            if self.repo.get_template(template_id).await?.is_none() {
                return Err(OrchestratorError::TemplateNotFound(template_id.clone()));
            }
        }

        let request_id = request.request_id.clone().unwrap_or_else(new_id);
        let constraints: RunConstraintOverrides = request
            .constraints
            .resolve(&self.settings.default_constraints())
            .into();
        let run_id = new_id();

        self.repo
            .create_run(&NewRun {
                id: run_id.clone(),
                task: request.task.clone(),
                template_id: request.template_id.clone(),
                constraints,
                metadata: json!({"request_id": request_id}),
            })
            .await?;
        self.emitter
            .emit(
                &run_id,
                None,
                EventType::RunCreated,
                json!({
                    "task": request.task,
                    "template_id": request.template_id,
                    "request_id": request_id,
                }),
            )
            .await?;
        self.orchestrator.start_run(&run_id, &request_id);

        self.repo
            .get_run(&run_id)
            .await?
            .ok_or(OrchestratorError::RunNotFound(run_id))
    }

    /// Cooperative cancel: flag the store, emit `cancel_requested`.
    /// Returns `false` for an unknown run.
    pub async fn cancel_run(&self, run_id: &str) -> Result<bool, OrchestratorError> {
        if self.repo.get_run(run_id).await?.is_none() {
            return Ok(false);
        }
        self.orchestrator.request_cancel(run_id).await?;
        self.emitter
            .emit(
                run_id,
                None,
                EventType::CancelRequested,
                json!({"request_id": new_id()}),
            )
            .await?;
        Ok(true)
    }

    /// Retry a failed run, optionally scoped to one step.
    pub async fn retry_run(
        &self,
        run_id: &str,
        step_id: Option<&str>,
    ) -> Result<bool, OrchestratorError> {
        self.orchestrator
            .retry_run(run_id, step_id, &new_id())
            .await
    }

    /// Full event feed for a run: stored history, then the live tail.
    pub async fn events(&self, run_id: &str) -> PersistenceResult<EventStream> {
        replay_then_tail(&self.repo, &self.broker, run_id).await
    }

    pub async fn get_run(&self, run_id: &str) -> PersistenceResult<Option<RunRecord>> {
        self.repo.get_run(run_id).await
    }

    pub async fn list_runs(&self, limit: i64) -> PersistenceResult<Vec<RunRecord>> {
        self.repo.list_runs(limit).await
    }

    pub async fn list_steps(&self, run_id: &str) -> PersistenceResult<Vec<StepRecord>> {
        self.repo.list_steps(run_id).await
    }

    pub async fn list_cost_entries(&self, run_id: &str) -> PersistenceResult<Vec<CostEntry>> {
        self.repo.list_cost_entries(run_id).await
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn repository(&self) -> Arc<Repository> {
        Arc::clone(&self.repo)
    }

    pub fn broker(&self) -> Arc<EventBroker> {
        Arc::clone(&self.broker)
    }

    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        Arc::clone(&self.orchestrator)
    }
}
