//! Taskflow Runtime — durable orchestration of LLM-driven runs.
//!
//! A run executes a DAG of steps against a generative model under per-step
//! contracts (timeouts, retries, model preference, output schema). The
//! control loop — plan → execute → monitor → reflect → finish — cooperates
//! with SQLite persistence so runs survive process restart, streams an
//! ordered event sequence to subscribers, and honors human cancel and retry.
//!
//! Layout:
//! - [`llm`] — provider trait, mock/OpenAI/Anthropic adapters, model
//!   routing, token pricing
//! - [`persistence`] — the sqlx/SQLite repository and record types
//! - [`events`] — broadcast fan-out, durable replay, SSE framing
//! - [`orchestration`] — planner, executor, monitor, reflection, and the
//!   orchestrator itself
//! - [`runtime`] — the facade wiring everything together at startup

pub mod config;
pub mod events;
pub mod llm;
pub mod orchestration;
pub mod persistence;
pub mod runtime;
pub mod telemetry;

pub use config::Settings;
pub use events::{EventBroker, EventEmitter, EventStream};
pub use orchestration::{Orchestrator, OrchestratorError};
pub use persistence::Repository;
pub use runtime::{RunRequest, Taskflow};
