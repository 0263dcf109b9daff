//! The Tool contract and parameter validation.
//!
//! Tools are pure producers: they hold no references to the registry, the
//! engine or the event bus. The registry owns every live instance.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

/// Declared type of one tool parameter.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    #[default]
    Any,
}

/// Schema entry for one parameter: type, requiredness, default, docs.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ParamSpec {
    #[serde(rename = "type", default)]
    pub kind: ParamKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub default: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl ParamSpec {
    pub fn required(kind: ParamKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            required: true,
            default: Value::Null,
            description: description.into(),
        }
    }

    pub fn optional(kind: ParamKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            required: false,
            default: Value::Null,
            description: description.into(),
        }
    }
}

pub type ParamSchema = BTreeMap<String, ParamSpec>;

/// Outcome of one tool execution. Duration is measured by the caller.
#[derive(Clone, Debug)]
pub enum ToolOutput {
    Success { data: Value, metadata: Value },
    Failure { error: String },
}

impl ToolOutput {
    pub fn success(data: Value) -> Self {
        Self::Success {
            data,
            metadata: Value::Null,
        }
    }

    pub fn success_with(data: Value, metadata: Value) -> Self {
        Self::Success { data, metadata }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }

    pub fn into_step_result(self, tool: &str, duration_ms: u64) -> selfforge_core::StepResult {
        match self {
            Self::Success { data, metadata } => selfforge_core::StepResult {
                tool: tool.to_string(),
                success: true,
                data,
                error: String::new(),
                duration_ms,
                metadata,
            },
            Self::Failure { error } => selfforge_core::StepResult {
                tool: tool.to_string(),
                success: false,
                data: Value::Null,
                error,
                duration_ms,
                metadata: Value::Null,
            },
        }
    }
}

/// The Tool trait. Implement this to add a capability the planner can
/// address by name.
#[async_trait::async_trait]
pub trait Tool: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Description surfaced to the planner.
    fn description(&self) -> &str;

    /// Parameter schema used for validation and the planner catalog.
    fn parameters_schema(&self) -> ParamSchema {
        ParamSchema::new()
    }

    /// Whether concurrent invocations are safe. The registry never
    /// synchronizes access; callers must honor this flag.
    fn concurrency_safe(&self) -> bool {
        false
    }

    /// Execute with validated parameters.
    async fn execute(&self, params: Map<String, Value>) -> ToolOutput;

    /// Execute with cancellation support. Default: race execute() against
    /// the token. Tools that spawn child processes should override this to
    /// kill the process on cancellation.
    async fn execute_cancellable(
        &self,
        params: Map<String, Value>,
        cancel: CancellationToken,
    ) -> ToolOutput {
        tokio::select! {
            result = self.execute(params) => result,
            _ = cancel.cancelled() => ToolOutput::failure("cancelled"),
        }
    }

    /// Called at unload. Best-effort; errors are logged, not propagated.
    async fn cleanup(&self) {}
}

const MAX_STRING_LEN: usize = 10_000;
const MAX_ARRAY_LEN: usize = 1_000;
const MAX_OBJECT_DEPTH: usize = 5;

/// Validate call arguments against a schema.
///
/// Missing required parameters and type mismatches fail. Oversized values
/// are coerced where safe: strings are truncated with an ellipsis suffix,
/// arrays are truncated; objects nested deeper than the cap are rejected.
/// Arguments not present in the schema pass through sanitized.
pub fn validate_params(
    args: &Map<String, Value>,
    schema: &ParamSchema,
) -> selfforge_core::Result<Map<String, Value>> {
    use selfforge_core::Error;

    let mut validated = Map::new();

    for (name, spec) in schema {
        let value = match args.get(name) {
            Some(v) if !v.is_null() => v.clone(),
            _ if !spec.default.is_null() => spec.default.clone(),
            _ if spec.required => {
                return Err(Error::invalid_args(format!(
                    "missing required parameter '{}'",
                    name
                )));
            }
            _ => continue,
        };

        if !kind_matches(spec.kind, &value) {
            return Err(Error::invalid_args(format!(
                "parameter '{}' has wrong type, expected {:?}",
                name, spec.kind
            )));
        }

        validated.insert(name.clone(), sanitize_value(name, value)?);
    }

    // Extra arguments the schema does not know about still get size caps.
    for (name, value) in args {
        if !schema.contains_key(name) {
            validated.insert(name.clone(), sanitize_value(name, value.clone())?);
        }
    }

    Ok(validated)
}

fn kind_matches(kind: ParamKind, value: &Value) -> bool {
    match kind {
        ParamKind::String => value.is_string(),
        ParamKind::Number => value.is_number(),
        ParamKind::Integer => value.is_i64() || value.is_u64(),
        ParamKind::Boolean => value.is_boolean(),
        ParamKind::Array => value.is_array(),
        ParamKind::Object => value.is_object(),
        ParamKind::Any => true,
    }
}

fn sanitize_value(name: &str, value: Value) -> selfforge_core::Result<Value> {
    use selfforge_core::Error;

    Ok(match value {
        Value::String(s) if s.chars().count() > MAX_STRING_LEN => {
            tracing::warn!("parameter '{}' truncated to {} chars", name, MAX_STRING_LEN);
            let truncated: String = s.chars().take(MAX_STRING_LEN).collect();
            Value::String(truncated + "...")
        }
        Value::Array(items) if items.len() > MAX_ARRAY_LEN => {
            tracing::warn!("parameter '{}' truncated to {} elements", name, MAX_ARRAY_LEN);
            Value::Array(items.into_iter().take(MAX_ARRAY_LEN).collect())
        }
        Value::Object(_) => {
            if object_depth(&value) > MAX_OBJECT_DEPTH {
                return Err(Error::invalid_args(format!(
                    "parameter '{}' nested deeper than {} levels",
                    name, MAX_OBJECT_DEPTH
                )));
            }
            value
        }
        other => other,
    })
}

fn object_depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(object_depth).max().unwrap_or(0),
        Value::Array(items) => items.iter().map(object_depth).max().unwrap_or(0),
        _ => 0,
    }
}
