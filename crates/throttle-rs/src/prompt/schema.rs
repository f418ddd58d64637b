//! JSON Schema validation of model output.

use crate::error::SchemaError;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A compiled response schema.
#[derive(Clone)]
pub struct ResponseSchema {
    schema: Value,
    validator: Arc<jsonschema::Validator>,
}

impl ResponseSchema {
    pub fn new(schema: Value) -> Result<Self, SchemaError> {
        let validator = jsonschema::validator_for(&schema)
            .map_err(|e| SchemaError::InvalidSchema(e.to_string()))?;
        Ok(Self {
            schema,
            validator: Arc::new(validator),
        })
    }

    /// Schema derived from a Rust type via `schemars`.
    pub fn for_type<T: schemars::JsonSchema>() -> Result<Self, SchemaError> {
        Self::new(crate::json_schema_for::<T>())
    }

    /// Accepts any string (plain-text responses).
    pub fn text() -> Result<Self, SchemaError> {
        Self::new(serde_json::json!({"type": "string"}))
    }

    pub fn schema(&self) -> &Value {
        &self.schema
    }

    /// Validate an already-parsed value.
    pub fn validate_value(&self, value: Value) -> Result<Value, SchemaError> {
        let errors: Vec<String> = self
            .validator
            .iter_errors(&value)
            .map(|e| format!("{}: {e}", e.instance_path()))
            .collect();
        if errors.is_empty() {
            Ok(value)
        } else {
            Err(SchemaError::Invalid {
                reason: errors.join("; "),
            })
        }
    }

    /// Parse raw model text and validate it.
    ///
    /// Tolerates markdown code fences and prose around a single JSON object
    /// or array. If the text is not JSON at all but the schema accepts a
    /// string, the trimmed text itself is the value.
    pub fn validate_text(&self, raw: &str) -> Result<Value, SchemaError> {
        let body = strip_code_fence(raw.trim());

        let parsed = serde_json::from_str::<Value>(body)
            .ok()
            .or_else(|| extract_json(body).and_then(|s| serde_json::from_str(s).ok()));

        match parsed {
            Some(value) => {
                let err = match self.validate_value(value) {
                    Ok(v) => return Ok(v),
                    Err(e) => e,
                };
                // A quoted string that failed may still pass as raw text.
                self.validate_value(Value::String(body.to_string()))
                    .map_err(|_| err)
            }
            None => self
                .validate_value(Value::String(body.to_string()))
                .map_err(|_| SchemaError::Invalid {
                    reason: format!("output is not valid JSON: {}", preview(body)),
                }),
        }
    }
}

impl fmt::Debug for ResponseSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseSchema")
            .field("schema", &self.schema)
            .finish()
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

/// The outermost `{...}` or `[...]` span, if any.
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let close = if text.get(start..)?.starts_with('{') {
        '}'
    } else {
        ']'
    };
    let end = text.rfind(close)?;
    if end > start { text.get(start..=end) } else { None }
}

fn preview(text: &str) -> String {
    let head: String = text.chars().take(80).collect();
    if head.len() < text.len() {
        format!("{head}...")
    } else {
        head
    }
}
