//! SQLite-backed repository.
//!
//! Owns every durable table: templates, runs, steps, events, cost ledger.
//! Writes serialize through one async lock held for the duration of a single
//! statement; reads go straight to the pool. Counter updates run as one
//! `UPDATE ... SET x = x + ?` statement so parallel workers never lose
//! increments to a read-modify-write race.

use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use tokio::sync::Mutex;

use taskflow_kernel::{
    Diagnostic, EventType, RunEvent, RunStatus, StepStatus, new_id, utc_now_iso,
};

use super::entities::{
    CostEntry, NewCostEntry, NewRun, RunRecord, RunUpdate, StepRecord, WorkflowTemplate,
};
use super::{PersistenceError, PersistenceResult};

/// Durable store over SQLite.
pub struct Repository {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

enum Arg {
    Text(Option<String>),
    Int(i64),
}

impl Repository {
    pub async fn connect(database_url: &str) -> PersistenceResult<Self> {
        // A pooled :memory: database gives every connection its own empty DB;
        // keep a single connection in that case.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        Self::connect_with_options(database_url, max_connections).await
    }

    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
    ) -> PersistenceResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| PersistenceError::Connection(e.to_string()))?;

        let repo = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        repo.run_migrations().await?;
        Ok(repo)
    }

    pub async fn in_memory() -> PersistenceResult<Self> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(&self) -> PersistenceResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS workflow_templates (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                version TEXT NOT NULL,
                description TEXT NOT NULL,
                graph_json TEXT NOT NULL,
                contracts_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                task TEXT NOT NULL,
                template_id TEXT,
                status TEXT NOT NULL,
                constraints_json TEXT NOT NULL,
                dag_json TEXT,
                diagnostics_json TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                ended_at TEXT,
                total_prompt_tokens INTEGER NOT NULL DEFAULT 0,
                total_completion_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                total_usd REAL NOT NULL DEFAULT 0,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                metadata_json TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS steps (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                max_retries INTEGER NOT NULL,
                started_at TEXT,
                ended_at TEXT,
                input_json TEXT NOT NULL,
                output_json TEXT,
                error_json TEXT,
                cost_json TEXT,
                logs_json TEXT,
                UNIQUE(run_id, node_id),
                FOREIGN KEY(run_id) REFERENCES runs(id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                step_id TEXT,
                event_type TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY(run_id) REFERENCES runs(id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS cost_ledger (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                step_id TEXT,
                app TEXT NOT NULL,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL,
                completion_tokens INTEGER NOT NULL,
                total_tokens INTEGER NOT NULL,
                usd REAL NOT NULL,
                metadata_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY(run_id) REFERENCES runs(id)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_runs_created_at ON runs(created_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_steps_run_id ON steps(run_id)",
            "CREATE INDEX IF NOT EXISTS idx_events_run_id_created_at ON events(run_id, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_cost_ledger_run_id_created_at ON cost_ledger(run_id, created_at)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| PersistenceError::Query(e.to_string()))?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // JSON helpers
    // -----------------------------------------------------------------------

    fn json_dump<T: Serialize>(value: &T) -> PersistenceResult<String> {
        serde_json::to_string(value).map_err(|e| PersistenceError::Serialization(e.to_string()))
    }

    fn json_load<T: DeserializeOwned>(raw: Option<String>) -> PersistenceResult<Option<T>> {
        match raw {
            Some(text) if !text.is_empty() => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| PersistenceError::Serialization(e.to_string())),
            _ => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Workflow templates
    // -----------------------------------------------------------------------

    pub async fn upsert_template(&self, template: &WorkflowTemplate) -> PersistenceResult<()> {
        let now = utc_now_iso();
        let graph_json = Self::json_dump(&template.graph)?;
        let contracts_json = Self::json_dump(&template.contracts)?;

        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            INSERT INTO workflow_templates (
                id, name, version, description, graph_json, contracts_json, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name=excluded.name,
                version=excluded.version,
                description=excluded.description,
                graph_json=excluded.graph_json,
                contracts_json=excluded.contracts_json,
                updated_at=excluded.updated_at
            "#,
        )
        .bind(&template.id)
        .bind(&template.name)
        .bind(&template.version)
        .bind(&template.description)
        .bind(graph_json)
        .bind(contracts_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::Query(e.to_string()))?;

        Ok(())
    }

    pub async fn list_templates(&self) -> PersistenceResult<Vec<WorkflowTemplate>> {
        let rows = sqlx::query("SELECT * FROM workflow_templates ORDER BY updated_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PersistenceError::Query(e.to_string()))?;

        rows.iter().map(Self::parse_template_row).collect()
    }

    pub async fn get_template(&self, template_id: &str) -> PersistenceResult<Option<WorkflowTemplate>> {
        let row = sqlx::query("SELECT * FROM workflow_templates WHERE id = ?")
            .bind(template_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| PersistenceError::Query(e.to_string()))?;

        row.as_ref().map(Self::parse_template_row).transpose()
    }

    fn parse_template_row(row: &SqliteRow) -> PersistenceResult<WorkflowTemplate> {
        let graph = Self::json_load(row.try_get("graph_json").ok())?.unwrap_or_default();
        let contracts = Self::json_load(row.try_get("contracts_json").ok())?.unwrap_or_default();

        Ok(WorkflowTemplate {
            id: row
                .try_get("id")
                .map_err(|e| PersistenceError::Query(e.to_string()))?,
            name: row
                .try_get("name")
                .map_err(|e| PersistenceError::Query(e.to_string()))?,
            version: row
                .try_get("version")
                .map_err(|e| PersistenceError::Query(e.to_string()))?,
            description: row
                .try_get("description")
                .map_err(|e| PersistenceError::Query(e.to_string()))?,
            graph,
            contracts,
            created_at: row.try_get("created_at").ok(),
            updated_at: row.try_get("updated_at").ok(),
        })
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    pub async fn create_run(&self, run: &NewRun) -> PersistenceResult<()> {
        let constraints_json = Self::json_dump(&run.constraints)?;
        let diagnostics_json = Self::json_dump(&Vec::<Diagnostic>::new())?;
        let metadata_json = Self::json_dump(&run.metadata)?;
        let created_at = utc_now_iso();

        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            INSERT INTO runs (
                id, task, template_id, status, constraints_json, diagnostics_json,
                created_at, metadata_json
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.task)
        .bind(&run.template_id)
        .bind(RunStatus::Created.as_str())
        .bind(constraints_json)
        .bind(diagnostics_json)
        .bind(created_at)
        .bind(metadata_json)
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::Query(e.to_string()))?;

        Ok(())
    }

    pub async fn list_runs(&self, limit: i64) -> PersistenceResult<Vec<RunRecord>> {
        let rows = sqlx::query("SELECT * FROM runs ORDER BY created_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PersistenceError::Query(e.to_string()))?;

        rows.iter().map(Self::parse_run_row).collect()
    }

    /// Runs that still need a worker: status in {created, running}.
    pub async fn list_incomplete_runs(&self) -> PersistenceResult<Vec<RunRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM runs WHERE status IN ('created', 'running') ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PersistenceError::Query(e.to_string()))?;

        rows.iter().map(Self::parse_run_row).collect()
    }

    pub async fn get_run(&self, run_id: &str) -> PersistenceResult<Option<RunRecord>> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| PersistenceError::Query(e.to_string()))?;

        row.as_ref().map(Self::parse_run_row).transpose()
    }

    /// Partial update; unset patch fields leave the column untouched.
    pub async fn update_run(&self, run_id: &str, patch: RunUpdate) -> PersistenceResult<()> {
        if patch.is_empty() {
            return Ok(());
        }

        let mut sets: Vec<&'static str> = Vec::new();
        let mut args: Vec<Arg> = Vec::new();

        if let Some(status) = patch.status {
            sets.push("status = ?");
            args.push(Arg::Text(Some(status.as_str().to_string())));
        }
        if let Some(started_at) = patch.started_at {
            sets.push("started_at = ?");
            args.push(Arg::Text(Some(started_at)));
        }
        if let Some(ended_at) = patch.ended_at {
            sets.push("ended_at = ?");
            args.push(Arg::Text(ended_at));
        }
        if let Some(flag) = patch.cancel_requested {
            sets.push("cancel_requested = ?");
            args.push(Arg::Int(i64::from(flag)));
        }
        if let Some(constraints) = patch.constraints {
            sets.push("constraints_json = ?");
            args.push(Arg::Text(Some(Self::json_dump(&constraints)?)));
        }
        if let Some(dag) = patch.dag {
            sets.push("dag_json = ?");
            args.push(Arg::Text(Some(Self::json_dump(&dag)?)));
        }
        if let Some(diagnostics) = patch.diagnostics {
            sets.push("diagnostics_json = ?");
            args.push(Arg::Text(Some(Self::json_dump(&diagnostics)?)));
        }
        if let Some(metadata) = patch.metadata {
            sets.push("metadata_json = ?");
            args.push(Arg::Text(Some(Self::json_dump(&metadata)?)));
        }

        let sql = format!("UPDATE runs SET {} WHERE id = ?", sets.join(", "));
        let mut query = sqlx::query(&sql);
        for arg in args {
            query = match arg {
                Arg::Text(text) => query.bind(text),
                Arg::Int(n) => query.bind(n),
            };
        }
        query = query.bind(run_id);

        let _guard = self.write_lock.lock().await;
        query
            .execute(&self.pool)
            .await
            .map_err(|e| PersistenceError::Query(e.to_string()))?;
        Ok(())
    }

    pub async fn request_cancel(&self, run_id: &str) -> PersistenceResult<()> {
        self.update_run(run_id, RunUpdate::new().cancel_requested(true))
            .await
    }

    /// Atomically add to the run's token and USD totals in one statement.
    pub async fn increment_run_totals(
        &self,
        run_id: &str,
        prompt_tokens: i64,
        completion_tokens: i64,
        total_tokens: i64,
        usd: f64,
    ) -> PersistenceResult<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            UPDATE runs SET
                total_prompt_tokens = total_prompt_tokens + ?,
                total_completion_tokens = total_completion_tokens + ?,
                total_tokens = total_tokens + ?,
                total_usd = total_usd + ?
            WHERE id = ?
            "#,
        )
        .bind(prompt_tokens)
        .bind(completion_tokens)
        .bind(total_tokens)
        .bind(usd)
        .bind(run_id)
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::Query(e.to_string()))?;
        Ok(())
    }

    /// Read-modify-write append. Best effort: concurrent appends to the same
    /// run can overwrite each other (a run has a single worker in-process).
    pub async fn append_diagnostic(
        &self,
        run_id: &str,
        diagnostic: Diagnostic,
    ) -> PersistenceResult<()> {
        let Some(run) = self.get_run(run_id).await? else {
            return Ok(());
        };
        let mut diagnostics = run.diagnostics;
        diagnostics.push(diagnostic);
        self.update_run(run_id, RunUpdate::new().diagnostics(diagnostics))
            .await
    }

    fn parse_run_row(row: &SqliteRow) -> PersistenceResult<RunRecord> {
        let status_raw: String = row
            .try_get("status")
            .map_err(|e| PersistenceError::Query(e.to_string()))?;
        let status: RunStatus = status_raw
            .parse()
            .map_err(PersistenceError::Serialization)?;

        let constraints = Self::json_load(row.try_get("constraints_json").ok())?.unwrap_or_default();
        let dag = Self::json_load(row.try_get("dag_json").ok())?;
        let diagnostics = Self::json_load(row.try_get("diagnostics_json").ok())?.unwrap_or_default();
        let metadata = Self::json_load(row.try_get("metadata_json").ok())?
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));

        Ok(RunRecord {
            id: row
                .try_get("id")
                .map_err(|e| PersistenceError::Query(e.to_string()))?,
            task: row
                .try_get("task")
                .map_err(|e| PersistenceError::Query(e.to_string()))?,
            template_id: row.try_get("template_id").ok().flatten(),
            status,
            constraints,
            dag,
            diagnostics,
            created_at: row
                .try_get("created_at")
                .map_err(|e| PersistenceError::Query(e.to_string()))?,
            started_at: row.try_get("started_at").ok().flatten(),
            ended_at: row.try_get("ended_at").ok().flatten(),
            total_prompt_tokens: row.try_get("total_prompt_tokens").unwrap_or(0),
            total_completion_tokens: row.try_get("total_completion_tokens").unwrap_or(0),
            total_tokens: row.try_get("total_tokens").unwrap_or(0),
            total_usd: row.try_get("total_usd").unwrap_or(0.0),
            cancel_requested: row.try_get::<i64, _>("cancel_requested").unwrap_or(0) != 0,
            metadata,
        })
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Insert or replace the step row keyed on `(run_id, node_id)`.
    pub async fn upsert_step(&self, step: &StepRecord) -> PersistenceResult<()> {
        let input_json = Self::json_dump(&step.input)?;
        let output_json = step.output.as_ref().map(Self::json_dump).transpose()?;
        let error_json = step.error.as_ref().map(Self::json_dump).transpose()?;
        let cost_json = step.cost.as_ref().map(Self::json_dump).transpose()?;
        let logs_json = Self::json_dump(&step.logs)?;

        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            INSERT INTO steps (
                id, run_id, node_id, status, attempts, max_retries, started_at,
                ended_at, input_json, output_json, error_json, cost_json, logs_json
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(run_id, node_id) DO UPDATE SET
                id=excluded.id,
                status=excluded.status,
                attempts=excluded.attempts,
                max_retries=excluded.max_retries,
                started_at=excluded.started_at,
                ended_at=excluded.ended_at,
                input_json=excluded.input_json,
                output_json=excluded.output_json,
                error_json=excluded.error_json,
                cost_json=excluded.cost_json,
                logs_json=excluded.logs_json
            "#,
        )
        .bind(&step.id)
        .bind(&step.run_id)
        .bind(&step.node_id)
        .bind(step.status.as_str())
        .bind(i64::from(step.attempts))
        .bind(i64::from(step.max_retries))
        .bind(&step.started_at)
        .bind(&step.ended_at)
        .bind(input_json)
        .bind(output_json)
        .bind(error_json)
        .bind(cost_json)
        .bind(logs_json)
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::Query(e.to_string()))?;

        Ok(())
    }

    pub async fn get_step(&self, step_id: &str) -> PersistenceResult<Option<StepRecord>> {
        let row = sqlx::query("SELECT * FROM steps WHERE id = ?")
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| PersistenceError::Query(e.to_string()))?;

        row.as_ref().map(Self::parse_step_row).transpose()
    }

    pub async fn get_step_by_node(
        &self,
        run_id: &str,
        node_id: &str,
    ) -> PersistenceResult<Option<StepRecord>> {
        let row = sqlx::query("SELECT * FROM steps WHERE run_id = ? AND node_id = ?")
            .bind(run_id)
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| PersistenceError::Query(e.to_string()))?;

        row.as_ref().map(Self::parse_step_row).transpose()
    }

    pub async fn list_steps(&self, run_id: &str) -> PersistenceResult<Vec<StepRecord>> {
        let rows = sqlx::query("SELECT * FROM steps WHERE run_id = ? ORDER BY started_at")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PersistenceError::Query(e.to_string()))?;

        rows.iter().map(Self::parse_step_row).collect()
    }

    /// Reset one step (by id, scoped to the run) to pending with zero attempts.
    pub async fn reset_step(&self, run_id: &str, step_id: &str) -> PersistenceResult<bool> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            r#"
            UPDATE steps SET
                status='pending',
                attempts=0,
                started_at=NULL,
                ended_at=NULL,
                output_json=NULL,
                error_json=NULL,
                cost_json=NULL
            WHERE run_id=? AND id=?
            "#,
        )
        .bind(run_id)
        .bind(step_id)
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// Reset every failed step in the run to pending. Attempts are preserved
    /// only in the step history events; the rows restart from zero.
    pub async fn reset_failed_steps(&self, run_id: &str) -> PersistenceResult<u64> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            r#"
            UPDATE steps SET
                status='pending',
                attempts=0,
                started_at=NULL,
                ended_at=NULL,
                output_json=NULL,
                error_json=NULL,
                cost_json=NULL
            WHERE run_id=? AND status='failed'
            "#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::Query(e.to_string()))?;

        Ok(result.rows_affected())
    }

    fn parse_step_row(row: &SqliteRow) -> PersistenceResult<StepRecord> {
        let status_raw: String = row
            .try_get("status")
            .map_err(|e| PersistenceError::Query(e.to_string()))?;
        let status: StepStatus = status_raw
            .parse()
            .map_err(PersistenceError::Serialization)?;

        Ok(StepRecord {
            id: row
                .try_get("id")
                .map_err(|e| PersistenceError::Query(e.to_string()))?,
            run_id: row
                .try_get("run_id")
                .map_err(|e| PersistenceError::Query(e.to_string()))?,
            node_id: row
                .try_get("node_id")
                .map_err(|e| PersistenceError::Query(e.to_string()))?,
            status,
            attempts: row.try_get::<i64, _>("attempts").unwrap_or(0) as u32,
            max_retries: row.try_get::<i64, _>("max_retries").unwrap_or(0) as u32,
            started_at: row.try_get("started_at").ok().flatten(),
            ended_at: row.try_get("ended_at").ok().flatten(),
            input: Self::json_load(row.try_get("input_json").ok())?
                .unwrap_or(serde_json::Value::Object(serde_json::Map::new())),
            output: Self::json_load(row.try_get("output_json").ok())?,
            error: Self::json_load(row.try_get("error_json").ok())?,
            cost: Self::json_load(row.try_get("cost_json").ok())?,
            logs: Self::json_load(row.try_get("logs_json").ok())?.unwrap_or_default(),
        })
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Append an event; returns the stored record for broker publication.
    pub async fn create_event(
        &self,
        run_id: &str,
        step_id: Option<&str>,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> PersistenceResult<RunEvent> {
        let event = RunEvent::new(run_id, step_id.map(str::to_string), event_type, payload);
        let payload_json = Self::json_dump(&event.payload)?;

        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            INSERT INTO events (id, run_id, step_id, event_type, payload_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(&event.run_id)
        .bind(&event.step_id)
        .bind(event.event_type.as_str())
        .bind(payload_json)
        .bind(&event.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::Query(e.to_string()))?;

        Ok(event)
    }

    /// Events for a run in `(created_at, id)` order, optionally after a cursor.
    pub async fn list_events(
        &self,
        run_id: &str,
        after_created_at: Option<&str>,
    ) -> PersistenceResult<Vec<RunEvent>> {
        let rows = match after_created_at {
            Some(cursor) => sqlx::query(
                "SELECT * FROM events WHERE run_id=? AND created_at>? ORDER BY created_at, id",
            )
            .bind(run_id)
            .bind(cursor)
            .fetch_all(&self.pool)
            .await,
            None => sqlx::query("SELECT * FROM events WHERE run_id=? ORDER BY created_at, id")
                .bind(run_id)
                .fetch_all(&self.pool)
                .await,
        }
        .map_err(|e| PersistenceError::Query(e.to_string()))?;

        rows.iter().map(Self::parse_event_row).collect()
    }

    fn parse_event_row(row: &SqliteRow) -> PersistenceResult<RunEvent> {
        let type_raw: String = row
            .try_get("event_type")
            .map_err(|e| PersistenceError::Query(e.to_string()))?;
        let event_type: EventType = type_raw
            .parse()
            .map_err(PersistenceError::Serialization)?;

        Ok(RunEvent {
            id: row
                .try_get("id")
                .map_err(|e| PersistenceError::Query(e.to_string()))?,
            run_id: row
                .try_get("run_id")
                .map_err(|e| PersistenceError::Query(e.to_string()))?,
            step_id: row.try_get("step_id").ok().flatten(),
            event_type,
            payload: Self::json_load(row.try_get("payload_json").ok())?
                .unwrap_or(serde_json::Value::Object(serde_json::Map::new())),
            created_at: row
                .try_get("created_at")
                .map_err(|e| PersistenceError::Query(e.to_string()))?,
        })
    }

    // -----------------------------------------------------------------------
    // Cost ledger
    // -----------------------------------------------------------------------

    pub async fn create_cost_entry(&self, entry: &NewCostEntry) -> PersistenceResult<CostEntry> {
        let stored = CostEntry {
            id: new_id(),
            run_id: entry.run_id.clone(),
            step_id: entry.step_id.clone(),
            app: entry.app.clone(),
            provider: entry.provider.clone(),
            model: entry.model.clone(),
            prompt_tokens: entry.prompt_tokens,
            completion_tokens: entry.completion_tokens,
            total_tokens: entry.total_tokens,
            usd: entry.usd,
            metadata: entry.metadata.clone(),
            created_at: utc_now_iso(),
        };
        let metadata_json = Self::json_dump(&stored.metadata)?;

        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            INSERT INTO cost_ledger (
                id, run_id, step_id, app, provider, model, prompt_tokens,
                completion_tokens, total_tokens, usd, metadata_json, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&stored.id)
        .bind(&stored.run_id)
        .bind(&stored.step_id)
        .bind(&stored.app)
        .bind(&stored.provider)
        .bind(&stored.model)
        .bind(stored.prompt_tokens)
        .bind(stored.completion_tokens)
        .bind(stored.total_tokens)
        .bind(stored.usd)
        .bind(metadata_json)
        .bind(&stored.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::Query(e.to_string()))?;

        Ok(stored)
    }

    pub async fn list_cost_entries(&self, run_id: &str) -> PersistenceResult<Vec<CostEntry>> {
        let rows = sqlx::query("SELECT * FROM cost_ledger WHERE run_id=? ORDER BY created_at")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PersistenceError::Query(e.to_string()))?;

        rows.iter().map(Self::parse_cost_row).collect()
    }

    fn parse_cost_row(row: &SqliteRow) -> PersistenceResult<CostEntry> {
        Ok(CostEntry {
            id: row
                .try_get("id")
                .map_err(|e| PersistenceError::Query(e.to_string()))?,
            run_id: row
                .try_get("run_id")
                .map_err(|e| PersistenceError::Query(e.to_string()))?,
            step_id: row.try_get("step_id").ok().flatten(),
            app: row
                .try_get("app")
                .map_err(|e| PersistenceError::Query(e.to_string()))?,
            provider: row
                .try_get("provider")
                .map_err(|e| PersistenceError::Query(e.to_string()))?,
            model: row
                .try_get("model")
                .map_err(|e| PersistenceError::Query(e.to_string()))?,
            prompt_tokens: row.try_get("prompt_tokens").unwrap_or(0),
            completion_tokens: row.try_get("completion_tokens").unwrap_or(0),
            total_tokens: row.try_get("total_tokens").unwrap_or(0),
            usd: row.try_get("usd").unwrap_or(0.0),
            metadata: Self::json_load(row.try_get("metadata_json").ok())?
                .unwrap_or(serde_json::Value::Object(serde_json::Map::new())),
            created_at: row
                .try_get("created_at")
                .map_err(|e| PersistenceError::Query(e.to_string()))?,
        })
    }
}
