//! Output schema registry.
//!
//! Step outputs are validated against the JSON Schema registered for their
//! node id. `understand_task` and `execute_task` have dedicated registrations;
//! every other node validates against the generic shape. All three currently
//! share the same structure: a summary string, a confidence in [0, 1], and an
//! artifacts map. Extra fields are permitted.

use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use serde_json::{Value, json};

/// Which registered output model applies to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputModel {
    Planner,
    Executor,
    Generic,
}

/// Registry lookup: planner and executor nodes by id, generic otherwise.
pub fn output_model(node_id: &str) -> OutputModel {
    match node_id {
        "understand_task" => OutputModel::Planner,
        "execute_task" => OutputModel::Executor,
        _ => OutputModel::Generic,
    }
}

fn step_output_schema() -> Value {
    json!({
        "type": "object",
        "required": ["summary", "confidence", "artifacts"],
        "properties": {
            "summary": {"type": "string"},
            "confidence": {"type": "number", "minimum": 0.0, "maximum": 1.0},
            "artifacts": {"type": "object"},
        },
        "additionalProperties": true,
    })
}

static PLANNER_SCHEMA: Lazy<JSONSchema> = Lazy::new(compile_step_output_schema);
static EXECUTOR_SCHEMA: Lazy<JSONSchema> = Lazy::new(compile_step_output_schema);
static GENERIC_SCHEMA: Lazy<JSONSchema> = Lazy::new(compile_step_output_schema);

fn compile_step_output_schema() -> JSONSchema {
    JSONSchema::compile(&step_output_schema()).expect("static step output schema compiles")
}

impl OutputModel {
    fn schema(&self) -> &'static JSONSchema {
        match self {
            Self::Planner => &PLANNER_SCHEMA,
            Self::Executor => &EXECUTOR_SCHEMA,
            Self::Generic => &GENERIC_SCHEMA,
        }
    }
}

/// Validate a step output against the schema registered for `node_id`.
/// Returns the validated output, or the validator's message on failure.
pub fn validate_output(node_id: &str, output: &Value) -> Result<Value, String> {
    let schema = output_model(node_id).schema();
    match schema.validate(output) {
        Ok(()) => Ok(output.clone()),
        Err(errors) => {
            let message = errors
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            Err(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_output() -> Value {
        json!({
            "summary": "done",
            "confidence": 0.7,
            "artifacts": {"model": "mock-default"},
        })
    }

    #[test]
    fn registry_maps_known_nodes() {
        assert_eq!(output_model("understand_task"), OutputModel::Planner);
        assert_eq!(output_model("execute_task"), OutputModel::Executor);
        assert_eq!(output_model("synthesize_results"), OutputModel::Generic);
        assert_eq!(output_model("anything_else"), OutputModel::Generic);
    }

    #[test]
    fn valid_output_passes_and_is_returned() {
        let output = valid_output();
        assert_eq!(validate_output("execute_task", &output).unwrap(), output);
    }

    #[test]
    fn confidence_out_of_range_is_rejected() {
        let mut output = valid_output();
        output["confidence"] = json!(1.2);
        assert!(validate_output("some_node", &output).is_err());
    }

    #[test]
    fn missing_summary_is_rejected_with_message() {
        let output = json!({"confidence": 0.5, "artifacts": {}});
        let err = validate_output("some_node", &output).unwrap_err();
        assert!(err.contains("summary"));
    }

    #[test]
    fn extra_fields_are_permitted() {
        let mut output = valid_output();
        output["extra"] = json!("fine");
        assert!(validate_output("some_node", &output).is_ok());
    }
}
