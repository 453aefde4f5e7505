//! Structured output contract shared by every reasoning engine.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("response contains no JSON object")]
    NotJson,
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("missing required field `{0}`")]
    MissingField(String),
    #[error("field `{field}` must be {expected}")]
    WrongType {
        field: String,
        expected: &'static str,
    },
    #[error("field `{0}` must not be empty")]
    EmptyField(String),
    #[error("confidence {0} is outside 0..=1")]
    ConfidenceOutOfRange(f64),
}

/// Validated provider output, before it is stamped into a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub purpose: String,
    pub rules: Vec<String>,
    pub workflows: Vec<String>,
    pub integration_points: Vec<String>,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldShape {
    Text,
    TextList,
    Score,
}

#[derive(Debug, Clone)]
pub struct SchemaField {
    pub name: &'static str,
    pub shape: FieldShape,
    pub description: &'static str,
}

#[derive(Debug, Clone)]
pub struct TargetSchema {
    fields: Vec<SchemaField>,
}

impl Default for TargetSchema {
    fn default() -> Self {
        Self::business_semantics()
    }
}

impl TargetSchema {
    pub fn business_semantics() -> Self {
        Self {
            fields: vec![
                SchemaField {
                    name: "purpose",
                    shape: FieldShape::Text,
                    description: "What business problem does this file solve?",
                },
                SchemaField {
                    name: "rules",
                    shape: FieldShape::TextList,
                    description: "Business rules this file implements or configures",
                },
                SchemaField {
                    name: "workflows",
                    shape: FieldShape::TextList,
                    description: "Business workflows this file participates in",
                },
                SchemaField {
                    name: "integration_points",
                    shape: FieldShape::TextList,
                    description: "Services, systems or dependencies this file integrates with",
                },
                SchemaField {
                    name: "confidence",
                    shape: FieldShape::Score,
                    description: "Confidence in this analysis between 0 and 1",
                },
            ],
        }
    }

    pub fn fields(&self) -> &[SchemaField] {
        &self.fields
    }

    /// JSON skeleton placed in prompts.
    pub fn describe(&self) -> String {
        let mut lines = Vec::with_capacity(self.fields.len() + 2);
        lines.push("{".to_string());
        for (i, field) in self.fields.iter().enumerate() {
            let value = match field.shape {
                FieldShape::Text => format!("\"{}\"", field.description),
                FieldShape::TextList => format!("[\"{}\"]", field.description),
                FieldShape::Score => "0.85".to_string(),
            };
            let comma = if i + 1 < self.fields.len() { "," } else { "" };
            lines.push(format!("    \"{}\": {}{}", field.name, value, comma));
        }
        lines.push("}".to_string());
        lines.join("\n")
    }

    /// Parses raw engine output and checks it field by field.
    pub fn validate(&self, raw: &str) -> Result<Classification, ValidationError> {
        let object = extract_object(raw)?;
        for field in &self.fields {
            let value = object
                .get(field.name)
                .ok_or_else(|| ValidationError::MissingField(field.name.to_string()))?;
            check_shape(field, value)?;
        }
        serde_json::from_value(Value::Object(object))
            .map_err(|e| ValidationError::InvalidJson(e.to_string()))
    }
}

fn check_shape(field: &SchemaField, value: &Value) -> Result<(), ValidationError> {
    let wrong = |expected| ValidationError::WrongType {
        field: field.name.to_string(),
        expected,
    };
    match field.shape {
        FieldShape::Text => {
            let text = value.as_str().ok_or_else(|| wrong("a string"))?;
            if text.trim().is_empty() {
                return Err(ValidationError::EmptyField(field.name.to_string()));
            }
        }
        FieldShape::TextList => {
            let items = value.as_array().ok_or_else(|| wrong("a list of strings"))?;
            if !items.iter().all(Value::is_string) {
                return Err(wrong("a list of strings"));
            }
        }
        FieldShape::Score => {
            let score = value.as_f64().ok_or_else(|| wrong("a number"))?;
            if !(0.0..=1.0).contains(&score) {
                return Err(ValidationError::ConfidenceOutOfRange(score));
            }
        }
    }
    Ok(())
}

/// Engines sometimes wrap the object in prose or a fenced block.
fn extract_object(raw: &str) -> Result<Map<String, Value>, ValidationError> {
    let start = raw.find('{').ok_or(ValidationError::NotJson)?;
    let end = raw.rfind('}').ok_or(ValidationError::NotJson)?;
    if end < start {
        return Err(ValidationError::NotJson);
    }
    match serde_json::from_str::<Value>(&raw[start..=end]) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ValidationError::NotJson),
        Err(e) => Err(ValidationError::InvalidJson(e.to_string())),
    }
}
