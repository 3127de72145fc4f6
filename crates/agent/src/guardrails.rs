//! Argument checks applied before a tool handler runs.
//!
//! Arguments must decode to a JSON object; when the tool declares a `parameters` schema the
//! object is validated against it and every violation is reported in one denial.

use serde_json::{Map, Value};
use syncso_core::domain::agent::ToolSpec;

#[derive(Clone, Debug, PartialEq)]
pub enum GuardrailDecision {
    Allow(Value),
    Deny { reason_code: &'static str, reason: String },
}

impl GuardrailDecision {
    fn deny(reason_code: &'static str, reason: impl Into<String>) -> Self {
        Self::Deny { reason_code, reason: reason.into() }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ArgumentGuardrail;

impl ArgumentGuardrail {
    /// Decodes provider-supplied argument text, then validates it.
    pub fn evaluate_raw(&self, spec: Option<&ToolSpec>, raw: &str) -> GuardrailDecision {
        let trimmed = raw.trim();
        let arguments = if trimmed.is_empty() {
            Value::Object(Map::new())
        } else {
            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) => value,
                Err(error) => {
                    return GuardrailDecision::deny(
                        "malformed_json",
                        format!("arguments are not valid JSON: {error}"),
                    )
                }
            }
        };
        self.evaluate(spec, arguments)
    }

    pub fn evaluate(&self, spec: Option<&ToolSpec>, arguments: Value) -> GuardrailDecision {
        if !arguments.is_object() {
            return GuardrailDecision::deny("not_an_object", "arguments must be a JSON object");
        }

        let Some(schema) = spec.map(|spec| &spec.parameters).filter(|schema| !schema.is_null())
        else {
            return GuardrailDecision::Allow(arguments);
        };

        let validator = match jsonschema::Validator::new(schema) {
            Ok(validator) => validator,
            Err(error) => {
                return GuardrailDecision::deny("invalid_schema", format!("invalid tool schema: {error}"))
            }
        };
        if validator.is_valid(&arguments) {
            return GuardrailDecision::Allow(arguments);
        }

        let violations: Vec<String> =
            validator.iter_errors(&arguments).map(|error| error.to_string()).collect();
        GuardrailDecision::deny("schema_violation", violations.join("; "))
    }
}
