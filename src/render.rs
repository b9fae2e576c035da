//! Canonical render output and the normalization rules that produce it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OutputViolation;

/// Normalized output of one render call.
///
/// Serializes as exactly `{"head": [...], "body": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderResult {
    /// Fragments for `<head>`, in the order the module returned them.
    pub head: Vec<String>,
    /// Markup for the SSR mount point.
    pub body: String,
}

impl RenderResult {
    /// Head fragments joined for splicing into `<head>`.
    pub fn head_html(&self) -> String {
        self.head.join("\n")
    }

    pub fn into_parts(self) -> (Vec<String>, String) {
        (self.head, self.body)
    }
}

/// Validate a render function's return value.
///
/// Nothing is defaulted: a missing `head` or `body` is a contract violation.
/// Extra keys are ignored and fragment contents are never touched.
pub(crate) fn normalize(value: Value) -> Result<RenderResult, OutputViolation> {
    let mut object = match value {
        Value::Object(object) => object,
        other => {
            return Err(OutputViolation::NotAnObject {
                found: json_type(&other),
            })
        }
    };

    let head = match object.remove("head") {
        None => return Err(OutputViolation::MissingHead),
        Some(Value::Array(entries)) => entries
            .into_iter()
            .enumerate()
            .map(|(index, entry)| match entry {
                Value::String(fragment) => Ok(fragment),
                other => Err(OutputViolation::HeadEntryNotString {
                    index,
                    found: json_type(&other),
                }),
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(other) => {
            return Err(OutputViolation::HeadNotArray {
                found: json_type(&other),
            })
        }
    };

    let body = match object.remove("body") {
        None => return Err(OutputViolation::MissingBody),
        Some(Value::String(body)) => body,
        Some(other) => {
            return Err(OutputViolation::BodyNotString {
                found: json_type(&other),
            })
        }
    };

    if !object.is_empty() {
        tracing::trace!(extra = ?object.keys().collect::<Vec<_>>(), "ignoring extra render result keys");
    }

    Ok(RenderResult { head, body })
}

/// A shape violation detected on the raw JS value, before serialization.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub(crate) enum RawViolation {
    NotAnObject { found: String },
    MissingHead,
    HeadNotArray { found: String },
    HeadEntryNotString { index: usize, found: String },
    MissingBody,
    BodyNotString { found: String },
}

impl From<RawViolation> for OutputViolation {
    fn from(raw: RawViolation) -> Self {
        match raw {
            RawViolation::NotAnObject { found } => OutputViolation::NotAnObject {
                found: js_type(&found),
            },
            RawViolation::MissingHead => OutputViolation::MissingHead,
            RawViolation::HeadNotArray { found } => OutputViolation::HeadNotArray {
                found: js_type(&found),
            },
            RawViolation::HeadEntryNotString { index, found } => {
                OutputViolation::HeadEntryNotString {
                    index,
                    found: js_type(&found),
                }
            }
            RawViolation::MissingBody => OutputViolation::MissingBody,
            RawViolation::BodyNotString { found } => OutputViolation::BodyNotString {
                found: js_type(&found),
            },
        }
    }
}

fn js_type(name: &str) -> &'static str {
    match name {
        "null" => "null",
        "undefined" => "undefined",
        "boolean" => "boolean",
        "number" => "number",
        "bigint" => "bigint",
        "string" => "string",
        "symbol" => "symbol",
        "function" => "function",
        "array" => "array",
        "object" => "object",
        _ => "unknown",
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
