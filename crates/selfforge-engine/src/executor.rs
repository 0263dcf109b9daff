//! Plan executor — runs plan steps sequentially with per-step events.
//!
//! Per step: Resolve -> Validate -> Execute. A failing step is recorded and
//! execution continues; the engine judges the overall task from the whole
//! sequence. Cancellation stops before the next step and signals the
//! currently running tool.

use selfforge_core::{Event, EventBus, Plan, PlanStep, StepResult};
use selfforge_tools::{validate_params, ToolOutput, ToolRegistry};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct PlanExecutor {
    registry: Arc<ToolRegistry>,
    bus: EventBus,
    tool_timeout: Duration,
}

impl PlanExecutor {
    pub fn new(registry: Arc<ToolRegistry>, bus: EventBus, tool_timeout_secs: u64) -> Self {
        Self {
            registry,
            bus,
            tool_timeout: Duration::from_secs(tool_timeout_secs),
        }
    }

    /// Execute all steps in plan order. Returns one result per attempted
    /// step; steps after a cancellation are not attempted.
    pub async fn run(
        &self,
        task: &str,
        plan: &Plan,
        cancel: &CancellationToken,
    ) -> Vec<StepResult> {
        let total = plan.steps.len();
        let mut results = Vec::with_capacity(total);

        for (index, step) in plan.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }

            info!("step {}/{}: {} ({})", index + 1, total, step.tool, step.reason);
            let result = self.execute_step(step, cancel).await;
            if !result.success {
                debug!("step {} failed: {}", index + 1, result.error);
            }
            results.push(result);

            self.bus.publish(Event::Progress {
                task: task.to_string(),
                progress: (index + 1) as f64 / total.max(1) as f64,
                details: format!("{}/{} steps", index + 1, total),
            });
        }

        if cancel.is_cancelled() {
            self.bus.publish(Event::Progress {
                task: task.to_string(),
                progress: results.len() as f64 / total.max(1) as f64,
                details: "cancelled".to_string(),
            });
        }

        results
    }

    async fn execute_step(&self, step: &PlanStep, cancel: &CancellationToken) -> StepResult {
        // Resolve
        let Some(canonical) = self.registry.resolve(&step.tool).await else {
            return StepResult::failure(&step.tool, format!("unknown tool: {}", step.tool));
        };
        let Some(tool) = self.registry.get(&canonical).await else {
            return StepResult::failure(&step.tool, format!("unknown tool: {}", step.tool));
        };

        // Validate
        let schema = self.registry.schema_for(&canonical).await.unwrap_or_default();
        let validated = match validate_params(&step.args, &schema) {
            Ok(v) => v,
            Err(e) => {
                return StepResult::failure(&canonical, format!("invalid args: {}", e));
            }
        };

        // Execute
        let parameters = serde_json::Value::Object(validated.clone());
        self.bus.publish(Event::ToolExecution {
            tool: canonical.clone(),
            parameters: parameters.clone(),
            result: None,
            timestamp: chrono::Utc::now(),
        });

        let step_cancel = cancel.child_token();
        let start = Instant::now();
        let output = match tokio::time::timeout(
            self.tool_timeout,
            tool.execute_cancellable(validated, step_cancel.clone()),
        )
        .await
        {
            Ok(output) => output,
            Err(_) => {
                // Deadline fires cancellation for this tool only.
                step_cancel.cancel();
                ToolOutput::failure(
                    selfforge_core::Error::ToolTimeout {
                        name: canonical.clone(),
                        seconds: self.tool_timeout.as_secs(),
                    }
                    .to_string(),
                )
            }
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        let result = output.into_step_result(&canonical, duration_ms);
        self.bus.publish(Event::ToolExecution {
            tool: canonical,
            parameters,
            result: Some(serde_json::to_value(&result).unwrap_or_default()),
            timestamp: chrono::Utc::now(),
        });
        result
    }
}
