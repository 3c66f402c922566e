//! Run event model.
//!
//! Events are append-only and totally ordered within a run by
//! `(created_at, id)`. The broker gives live fan-out; the events table gives
//! durable replay.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::clock::{new_id, utc_now_iso};

/// Every event kind the orchestrator emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunCreated,
    RunStarted,
    PlanningStarted,
    PlanningFinished,
    StepStarted,
    StepFinished,
    StepRetryScheduled,
    StepFailed,
    Replanned,
    Reflection,
    CancelRequested,
    RunRetryRequested,
    RunFinished,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunCreated => "run_created",
            Self::RunStarted => "run_started",
            Self::PlanningStarted => "planning_started",
            Self::PlanningFinished => "planning_finished",
            Self::StepStarted => "step_started",
            Self::StepFinished => "step_finished",
            Self::StepRetryScheduled => "step_retry_scheduled",
            Self::StepFailed => "step_failed",
            Self::Replanned => "replanned",
            Self::Reflection => "reflection",
            Self::CancelRequested => "cancel_requested",
            Self::RunRetryRequested => "run_retry_requested",
            Self::RunFinished => "run_finished",
        }
    }

    /// The only event type that terminates a run's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunFinished)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run_created" => Ok(Self::RunCreated),
            "run_started" => Ok(Self::RunStarted),
            "planning_started" => Ok(Self::PlanningStarted),
            "planning_finished" => Ok(Self::PlanningFinished),
            "step_started" => Ok(Self::StepStarted),
            "step_finished" => Ok(Self::StepFinished),
            "step_retry_scheduled" => Ok(Self::StepRetryScheduled),
            "step_failed" => Ok(Self::StepFailed),
            "replanned" => Ok(Self::Replanned),
            "reflection" => Ok(Self::Reflection),
            "cancel_requested" => Ok(Self::CancelRequested),
            "run_retry_requested" => Ok(Self::RunRetryRequested),
            "run_finished" => Ok(Self::RunFinished),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

/// A single run event, as stored and as published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub id: String,
    pub run_id: String,
    #[serde(default)]
    pub step_id: Option<String>,
    pub event_type: EventType,
    pub payload: Value,
    pub created_at: String,
}

impl RunEvent {
    /// Build a fresh event stamped with a new id and the current time.
    pub fn new(
        run_id: impl Into<String>,
        step_id: Option<String>,
        event_type: EventType,
        payload: Value,
    ) -> Self {
        Self {
            id: new_id(),
            run_id: run_id.into(),
            step_id,
            event_type,
            payload,
            created_at: utc_now_iso(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_round_trips() {
        for ty in [
            EventType::RunCreated,
            EventType::StepRetryScheduled,
            EventType::RunFinished,
        ] {
            assert_eq!(ty.as_str().parse::<EventType>().unwrap(), ty);
        }
    }

    #[test]
    fn only_run_finished_is_terminal() {
        assert!(EventType::RunFinished.is_terminal());
        assert!(!EventType::StepFailed.is_terminal());
    }

    #[test]
    fn serializes_snake_case() {
        let event = RunEvent::new("r1", None, EventType::PlanningStarted, serde_json::json!({}));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "planning_started");
        assert!(json["created_at"].as_str().unwrap().ends_with('Z'));
    }
}
