//! Core status and error vocabulary shared by every layer.
//!
//! These enums are the wire names: they serialize to the lowercase /
//! snake_case strings stored in SQLite and carried in event payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Run Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Created,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl RunStatus {
    /// Returns `true` once the run can no longer make progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Step Status
// ---------------------------------------------------------------------------

/// Status of a step (and of its DAG node — both share this vocabulary).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Canceled,
}

impl StepStatus {
    /// Terminal step states: the step will not be re-run without an explicit retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Canceled
        )
    }

    /// States counted as "settled successfully" for run completion.
    pub fn is_settled_success(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "canceled" => Ok(Self::Canceled),
            other => Err(format!("unknown step status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure taxonomy
// ---------------------------------------------------------------------------

/// Structured failure code attached to steps and finish reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    Timeout,
    BudgetExceeded,
    SchemaError,
    ToolNotAllowed,
    ExecutionError,
    Canceled,
    MaxStepsExceeded,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::BudgetExceeded => "budget_exceeded",
            Self::SchemaError => "schema_error",
            Self::ToolNotAllowed => "tool_not_allowed",
            Self::ExecutionError => "execution_error",
            Self::Canceled => "canceled",
            Self::MaxStepsExceeded => "max_steps_exceeded",
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse failure classification driving reflection's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    Timeout,
    SchemaError,
    LowConfidence,
    BudgetRisk,
    Other,
}

impl FailureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::SchemaError => "schema_error",
            Self::LowConfidence => "low_confidence",
            Self::BudgetRisk => "budget_risk",
            Self::Other => "other",
        }
    }

    /// Classify a step failure code into a reflection failure mode.
    pub fn from_failure_code(code: FailureCode) -> Self {
        match code {
            FailureCode::Timeout => Self::Timeout,
            FailureCode::SchemaError => Self::SchemaError,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action reflection decided to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReflectionAction {
    Replanned,
    AdjustedParameters,
    Terminated,
}

impl ReflectionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Replanned => "replanned",
            Self::AdjustedParameters => "adjusted_parameters",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for ReflectionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Structured records
// ---------------------------------------------------------------------------

/// Structured error stored on failed steps and DAG nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredError {
    pub code: FailureCode,
    pub message: String,
    #[serde(default = "empty_object")]
    pub details: Value,
}

impl StructuredError {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: empty_object(),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Per-call cost attribution attached to steps and ledger rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    pub provider: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub usd: f64,
}

/// One reflection decision, appended to the run's diagnostics list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub reason: String,
    pub failure_mode: FailureMode,
    pub action_taken: ReflectionAction,
}
