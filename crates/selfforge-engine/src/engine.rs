//! Task engine — the top-level loop.
//!
//! analyze -> (optionally synthesize a tool) -> plan -> execute ->
//! synthesize result -> score -> record experience. Collaborators are
//! injected at construction; the engine owns no global state and never
//! instantiates tools itself — every tool comes from the registry.

use crate::executor::PlanExecutor;
use crate::experience::ExperienceStore;
use selfforge_core::{
    Error, Event, EventBus, LogLevel, StepResult, TaskId, TaskOutcome, TaskRecord,
};
use selfforge_llm::{gate::fallback_plan, LlmGate};
use selfforge_tools::{ToolRegistry, ToolSynthesizer};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub tool_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
        }
    }
}

pub struct TaskEngine {
    gate: Arc<LlmGate>,
    registry: Arc<ToolRegistry>,
    synthesizer: Arc<ToolSynthesizer>,
    store: Arc<ExperienceStore>,
    bus: EventBus,
    executor: PlanExecutor,
}

impl TaskEngine {
    pub fn new(
        gate: Arc<LlmGate>,
        registry: Arc<ToolRegistry>,
        synthesizer: Arc<ToolSynthesizer>,
        store: Arc<ExperienceStore>,
        bus: EventBus,
        config: EngineConfig,
    ) -> Self {
        let executor = PlanExecutor::new(registry.clone(), bus.clone(), config.tool_timeout_secs);
        Self {
            gate,
            registry,
            synthesizer,
            store,
            bus,
            executor,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Aggregate view of how the runtime has evolved: task statistics from
    /// the experience store plus the current catalog shape.
    pub async fn evolution_status(&self) -> serde_json::Value {
        let summary = self.store.summary().await.ok();
        let names = self.registry.list().await;
        let mut dynamic_tools = 0;
        for name in &names {
            if let Some(meta) = self.registry.metadata(name).await {
                if meta.category == "dynamic" {
                    dynamic_tools += 1;
                }
            }
        }
        serde_json::json!({
            "experience": summary,
            "tools_total": names.len(),
            "tools_loaded": self.registry.loaded_count().await,
            "tools_created": dynamic_tools,
        })
    }

    /// Execute one task end to end. Always returns an outcome and always
    /// emits a terminal `task_completed` event; per-step failures and
    /// enrichment failures (synthesis, scoring, recording) never abort.
    pub async fn execute_task(
        &self,
        description: &str,
        cancel: CancellationToken,
    ) -> TaskOutcome {
        let task = description.trim();
        let task_id = TaskId::generate();

        if task.is_empty() {
            let reason = Error::InvalidTask("empty description".to_string()).to_string();
            let outcome = self.failed_outcome(&task_id, task, &reason);
            self.emit_completed(&outcome);
            return outcome;
        }

        let started = Instant::now();
        self.bus.publish(Event::log(
            LogLevel::Info,
            format!("task {} started: {}", task_id, task),
        ));
        info!("task {} started: {}", task_id, task);

        // Tool-creation analysis. Failure here never aborts the task.
        self.maybe_synthesize_tool(task, &cancel).await;

        // With nothing loaded there is nothing to plan against.
        if self.registry.loaded_count().await == 0 {
            warn!("task {}: no tools available", task_id);
            let outcome = self.failed_outcome(&task_id, task, "no tools available");
            self.emit_completed(&outcome);
            return outcome;
        }

        let task_type = match self.gate.classify_task_type(task, Some(cancel.clone())).await {
            Ok(t) => t,
            Err(e) => {
                warn!("task classification failed: {}", e);
                "general".to_string()
            }
        };

        // Past experience, if any, becomes a planning hint.
        let hint = match self.store.recommend(&task_type).await {
            Ok(Some(rec)) => Some(format!(
                "similar {} tasks succeeded {:.0}% of the time using tools: {}",
                task_type,
                rec.estimated_success * 100.0,
                rec.recommended_tools.join(", ")
            )),
            Ok(None) => None,
            Err(e) => {
                warn!("recommendation lookup failed: {}", e);
                None
            }
        };

        let catalog = self.registry.catalog_summary().await;
        let plan = match self
            .gate
            .generate_plan(task, &catalog, hint.as_deref(), Some(cancel.clone()))
            .await
        {
            Ok(plan) => plan,
            Err(e) => {
                warn!("plan generation failed ({}), using fallback", e);
                fallback_plan(task)
            }
        };
        self.bus.publish(Event::log(
            LogLevel::Info,
            format!("plan: {} ({} steps)", plan.description, plan.steps.len()),
        ));

        let step_results = self.executor.run(task, &plan, &cancel).await;
        let cancelled = cancel.is_cancelled();

        let (result_text, quality) = if cancelled {
            ("task cancelled".to_string(), 0.0)
        } else {
            let text = match self
                .gate
                .synthesize_result(task, &step_results, &plan, None)
                .await
            {
                Ok(text) => text,
                Err(e) => {
                    warn!("result synthesis failed ({}), summarizing locally", e);
                    summarize_locally(&step_results)
                }
            };
            let quality = match self.gate.score_quality(&text, None).await {
                Ok(q) => q,
                Err(e) => {
                    warn!("quality scoring failed: {}", e);
                    0.5
                }
            };
            (text, quality)
        };

        let success = !cancelled && step_results.iter().any(|r| r.success);
        let reason = if cancelled {
            Some(Error::Cancelled.to_string())
        } else if !success {
            Some("all steps failed".to_string())
        } else {
            None
        };

        let outcome = TaskOutcome {
            task_id: task_id.to_string(),
            description: task.to_string(),
            task_type,
            result: result_text,
            success,
            reason,
            step_results,
            duration_ms: started.elapsed().as_millis() as u64,
            quality,
        };

        if let Err(e) = self.store.record(&TaskRecord::from_outcome(&outcome)).await {
            warn!("experience recording failed: {}", e);
        }

        self.emit_completed(&outcome);
        info!(
            "task {} finished: success={} steps={} duration={}ms",
            outcome.task_id,
            outcome.success,
            outcome.step_results.len(),
            outcome.duration_ms
        );
        outcome
    }

    /// Ask the gate whether a new tool is warranted; if so, run the
    /// synthesizer. Every failure path logs and returns — synthesis is an
    /// enrichment, never a requirement.
    async fn maybe_synthesize_tool(&self, task: &str, cancel: &CancellationToken) {
        let analysis = match self
            .gate
            .analyze_tool_need(task, Some(cancel.clone()))
            .await
        {
            Ok(a) => a,
            Err(e) => {
                warn!("tool-need analysis failed: {}", e);
                return;
            }
        };

        if !analysis.should_create || analysis.tool_name.is_empty() {
            return;
        }

        if self.registry.resolve(&analysis.tool_name).await.is_some() {
            info!("tool '{}' already registered", analysis.tool_name);
            return;
        }

        let spec = analysis.into();
        match self
            .synthesizer
            .create(spec, false, Some(cancel.clone()))
            .await
        {
            Ok(result) => {
                self.bus.publish(Event::log(
                    LogLevel::Info,
                    format!(
                        "created specialized tool '{}'{}",
                        result.name,
                        if result.safety_fallback {
                            " (safety fallback stub)"
                        } else {
                            ""
                        }
                    ),
                ));
            }
            Err(Error::AlreadyRegistered(name)) => {
                // Lost a synthesis race; the winner's tool serves.
                info!("synthesis race lost for '{}', adopting existing tool", name);
            }
            Err(e) => {
                warn!("tool synthesis failed: {}", e);
                self.bus.publish(Event::log(
                    LogLevel::Warn,
                    format!("tool synthesis failed: {}", e),
                ));
            }
        }
    }

    fn failed_outcome(&self, task_id: &TaskId, task: &str, reason: &str) -> TaskOutcome {
        TaskOutcome {
            task_id: task_id.to_string(),
            description: task.to_string(),
            task_type: "general".to_string(),
            result: reason.to_string(),
            success: false,
            reason: Some(reason.to_string()),
            step_results: Vec::new(),
            duration_ms: 0,
            quality: 0.0,
        }
    }

    fn emit_completed(&self, outcome: &TaskOutcome) {
        self.bus.publish(Event::TaskCompleted {
            result: outcome.result.clone(),
            metadata: serde_json::json!({
                "task_id": outcome.task_id,
                "task_type": outcome.task_type,
                "tool_results": outcome.step_results,
                "duration_ms": outcome.duration_ms,
                "quality": outcome.quality,
                "reason": outcome.reason,
            }),
            success: outcome.success,
        });
    }
}

/// Fallback summary when result synthesis is unavailable.
fn summarize_locally(step_results: &[StepResult]) -> String {
    let succeeded = step_results.iter().filter(|r| r.success).count();
    let mut summary = format!(
        "completed {}/{} steps",
        succeeded,
        step_results.len()
    );
    if let Some(last_ok) = step_results.iter().rev().find(|r| r.success) {
        summary.push_str(&format!(
            "; last output: {}",
            serde_json::to_string(&last_ok.data).unwrap_or_default()
        ));
    }
    summary
}
