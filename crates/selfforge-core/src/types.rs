//! Task, plan and record types shared across the runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Task identifier - cheaply cloneable, stable for the lifetime of one task.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct TaskId(Arc<str>);

impl TaskId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }

    /// Allocate a fresh unique id.
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// An ordered sequence of tool invocations produced by the LLM for a task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<PlanStep>,
}

/// A single planned invocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanStep {
    pub tool: String,
    #[serde(default, alias = "parameters")]
    pub args: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub reason: String,
}

impl PlanStep {
    pub fn new(tool: impl Into<String>, args: serde_json::Value, reason: impl Into<String>) -> Self {
        let args = match args {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        Self {
            tool: tool.into(),
            args,
            reason: reason.into(),
        }
    }
}

/// Outcome of one executed plan step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepResult {
    pub tool: String,
    pub success: bool,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub error: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl StepResult {
    pub fn failure(tool: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            success: false,
            data: serde_json::Value::Null,
            error: error.into(),
            duration_ms: 0,
            metadata: serde_json::Value::Null,
        }
    }
}

/// Full outcome of one task, returned to the caller and surfaced over the
/// control interface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub description: String,
    pub task_type: String,
    pub result: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub step_results: Vec<StepResult>,
    pub duration_ms: u64,
    pub quality: f64,
}

/// Persisted record of one task execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub description: String,
    pub task_type: String,
    pub tools_used: Vec<String>,
    pub success: bool,
    pub duration_ms: u64,
    pub quality: f64,
    pub created_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn from_outcome(outcome: &TaskOutcome) -> Self {
        Self {
            task_id: outcome.task_id.clone(),
            description: outcome.description.clone(),
            task_type: outcome.task_type.clone(),
            tools_used: outcome
                .step_results
                .iter()
                .map(|r| r.tool.clone())
                .collect(),
            success: outcome.success,
            duration_ms: outcome.duration_ms,
            quality: outcome.quality,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_id_roundtrip() {
        let id = TaskId::new("abc");
        assert_eq!(id.as_str(), "abc");
        assert_eq!(id.to_string(), "abc");
    }

    #[test]
    fn generated_task_ids_are_unique() {
        assert_ne!(TaskId::generate(), TaskId::generate());
    }

    #[test]
    fn plan_step_accepts_parameters_alias() {
        let step: PlanStep = serde_json::from_value(json!({
            "tool": "terminal",
            "parameters": {"command": "ls"},
            "reason": "list files"
        }))
        .unwrap();
        assert_eq!(step.tool, "terminal");
        assert_eq!(step.args["command"], "ls");
    }

    #[test]
    fn plan_step_non_object_args_become_empty() {
        let step = PlanStep::new("code", json!("not a map"), "");
        assert!(step.args.is_empty());
    }

    #[test]
    fn task_record_collects_tools_from_steps() {
        let outcome = TaskOutcome {
            task_id: "t1".into(),
            description: "d".into(),
            task_type: "general".into(),
            result: "ok".into(),
            success: true,
            reason: None,
            step_results: vec![
                StepResult::failure("terminal", "boom"),
                StepResult::failure("code", "boom"),
            ],
            duration_ms: 5,
            quality: 0.5,
        };
        let record = TaskRecord::from_outcome(&outcome);
        assert_eq!(record.tools_used, vec!["terminal", "code"]);
    }
}
