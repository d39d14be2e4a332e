//! Pluggable parsers for captured subprocess output.
//!
//! The runner never interprets output itself; it hands stdout to the
//! [`OutputParser`] supplied by the caller and caches whatever comes back.

use jsonschema::{Draft, Validator};
use serde_json::Value;

use crate::error::RunnerError;

/// Turns raw stdout into the result text returned to callers.
pub trait OutputParser: Send + Sync {
    fn parse(&self, raw: &str) -> Result<String, RunnerError>;
}

/// Plain text: trimmed stdout. Empty output is rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextOutput;

impl OutputParser for TextOutput {
    fn parse(&self, raw: &str) -> Result<String, RunnerError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(RunnerError::InvalidOutput("empty output".to_string()));
        }
        Ok(trimmed.to_string())
    }
}

/// JSON output validated against a JSON Schema (Draft 2020-12).
pub struct JsonSchemaOutput {
    validator: Validator,
}

impl JsonSchemaOutput {
    pub fn new(schema: &Value) -> Result<Self, RunnerError> {
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(schema)
            .map_err(|e| RunnerError::Config(format!("compile output schema: {e}")))?;
        Ok(Self { validator })
    }
}

impl OutputParser for JsonSchemaOutput {
    fn parse(&self, raw: &str) -> Result<String, RunnerError> {
        let body = strip_code_fence(raw.trim());
        let value: Value = serde_json::from_str(body)
            .map_err(|e| RunnerError::InvalidOutput(format!("parse json: {e}")))?;
        let messages: Vec<String> = self
            .validator
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect();
        if !messages.is_empty() {
            return Err(RunnerError::InvalidOutput(format!(
                "schema validation failed:\n- {}",
                messages.join("\n- ")
            )));
        }
        serde_json::to_string_pretty(&value)
            .map_err(|e| RunnerError::InvalidOutput(format!("serialize json: {e}")))
    }
}

/// Agents like to wrap JSON in a markdown fence.
fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["verdict"],
            "properties": { "verdict": { "enum": ["approve", "comment"] } }
        })
    }

    #[test]
    fn text_output_trims_and_rejects_empty() {
        assert_eq!(TextOutput.parse("  LGTM\n").expect("parse"), "LGTM");
        assert!(matches!(
            TextOutput.parse(" \n"),
            Err(RunnerError::InvalidOutput(_))
        ));
    }

    #[test]
    fn json_output_accepts_fenced_valid_document() {
        let parser = JsonSchemaOutput::new(&schema()).expect("schema");
        let parsed = parser
            .parse("```json\n{\"verdict\": \"approve\"}\n```")
            .expect("parse");
        let value: Value = serde_json::from_str(&parsed).expect("json");
        assert_eq!(value["verdict"], "approve");
    }

    #[test]
    fn json_output_reports_schema_violations() {
        let parser = JsonSchemaOutput::new(&schema()).expect("schema");
        let err = parser.parse("{\"verdict\": \"reject\"}").unwrap_err();
        assert!(err.to_string().contains("schema validation failed"));
    }
}
