//! The LLM gate: every named operation the runtime poses to the model.
//!
//! Each operation owns its prompt template, its response parsing and its
//! fallback. Parse failures never propagate; transport failures surface as
//! `LlmError` only after the retry budget is spent, and callers treat that
//! as non-fatal.

use crate::provider::{ChatRequest, LlmError, LlmProvider, LlmResult};
use selfforge_core::types::{Plan, PlanStep, StepResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Verdict of the source safety gate. Unclear is treated as Unsafe by
/// every caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SafetyVerdict {
    Safe,
    Unsafe,
    Unclear,
}

impl SafetyVerdict {
    pub fn is_safe(self) -> bool {
        matches!(self, Self::Safe)
    }
}

/// Result of the tool-creation analysis.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ToolCreationAnalysis {
    #[serde(default, alias = "should_create_tool")]
    pub should_create: bool,
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub tool_description: String,
    #[serde(default)]
    pub tool_parameters: serde_json::Value,
    #[serde(default)]
    pub implementation_approach: String,
    #[serde(default)]
    pub reasoning: String,
}

/// Specification handed to the synthesizer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// Mapping name -> {type, required, default, description}.
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub approach: String,
}

impl From<ToolCreationAnalysis> for ToolSpec {
    fn from(a: ToolCreationAnalysis) -> Self {
        Self {
            name: a.tool_name,
            description: a.tool_description,
            parameters: a.tool_parameters,
            approach: a.implementation_approach,
        }
    }
}

pub struct LlmGate {
    provider: Arc<dyn LlmProvider>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    max_attempts: u32,
}

impl LlmGate {
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: 0.3,
            max_tokens: 2000,
            max_attempts: 3,
        }
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    /// Complete with bounded retry. Non-retryable errors (auth, cancel)
    /// return immediately.
    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
        cancel: Option<CancellationToken>,
    ) -> LlmResult<String> {
        let mut backoff = Duration::from_millis(300);
        let mut last_err = LlmError::RequestFailed("no attempts made".to_string());

        for attempt in 1..=self.max_attempts {
            let request = ChatRequest {
                model: self.model.clone(),
                system: Some(system.to_string()),
                prompt: prompt.to_string(),
                temperature,
                max_tokens,
            };
            match self.provider.complete(request, cancel.clone()).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    warn!("llm attempt {}/{} failed: {}", attempt, self.max_attempts, e);
                    let wait = match &e {
                        LlmError::RateLimited { retry_after_ms } => {
                            Duration::from_millis((*retry_after_ms).min(5_000))
                        }
                        _ => backoff,
                    };
                    tokio::time::sleep(wait).await;
                    backoff *= 2;
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    /// Decide whether the task warrants synthesizing a specialized tool.
    /// Parse failure means "no".
    pub async fn analyze_tool_need(
        &self,
        task: &str,
        cancel: Option<CancellationToken>,
    ) -> LlmResult<ToolCreationAnalysis> {
        let system = "You are an intelligent task analyzer. Decide whether a specialized \
             tool should be created to handle this task.\n\
             Consider: real-time data requirements, accuracy needs, whether \
             existing generic tools suffice, and whether the task type recurs.\n\
             Respond with ONLY a JSON object:\n\
             {\"should_create\": true/false, \"tool_name\": \"snake_case_name\", \
             \"tool_description\": \"...\", \
             \"tool_parameters\": {\"param\": {\"type\": \"string\", \"required\": true, \"description\": \"...\"}}, \
             \"implementation_approach\": \"...\", \"reasoning\": \"...\"}";
        let prompt = format!("Analyze this task: {}", task);

        let text = self
            .complete(system, &prompt, self.temperature, 500, cancel)
            .await?;

        match parse_json_object::<ToolCreationAnalysis>(&text) {
            Some(analysis) => {
                debug!(
                    "tool-need analysis: should_create={} name={}",
                    analysis.should_create, analysis.tool_name
                );
                Ok(analysis)
            }
            None => {
                warn!("unparseable tool-need analysis, defaulting to no");
                Ok(ToolCreationAnalysis::default())
            }
        }
    }

    /// Classify the task into a free-form lowercase category.
    pub async fn classify_task_type(
        &self,
        task: &str,
        cancel: Option<CancellationToken>,
    ) -> LlmResult<String> {
        let system = "You are a task analysis expert. Classify the task into the most \
             appropriate category, e.g. time, weather, calculation, search, \
             system, programming, communication, utility, analysis, custom.\n\
             Respond with ONLY the category word, no additional text.";
        let text = self
            .complete(system, task, self.temperature, 50, cancel)
            .await?;

        let category = strip_code_fences(&text)
            .trim()
            .to_lowercase()
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();
        if category.is_empty() {
            Ok("general".to_string())
        } else {
            Ok(category)
        }
    }

    /// Generate an execution plan against the given tool catalog. On parse
    /// failure, fall back to a single code-execution step carrying the raw
    /// task text.
    pub async fn generate_plan(
        &self,
        task: &str,
        catalog_summary: &str,
        hint: Option<&str>,
        cancel: Option<CancellationToken>,
    ) -> LlmResult<Plan> {
        let system = format!(
            "You are a task planning expert for an AI agent. Select the most \
             suitable tools from the registry below and order their execution.\n\n\
             Available tools:\n{}\n\n\
             Only use tools listed above. Respond with ONLY valid JSON:\n\
             {{\"description\": \"brief plan summary\", \"steps\": [{{\"tool\": \
             \"name\", \"args\": {{\"param\": \"value\"}}, \"reason\": \"why\"}}]}}",
            catalog_summary
        );
        let prompt = match hint {
            Some(h) => format!("Task: {}\n\nHint from past experience: {}\n\nCreate the execution plan:", task, h),
            None => format!("Task: {}\n\nCreate the execution plan:", task),
        };

        let text = self
            .complete(&system, &prompt, self.temperature, self.max_tokens, cancel)
            .await?;

        match parse_json_object::<Plan>(&text) {
            Some(plan) if !plan.steps.is_empty() => Ok(plan),
            _ => {
                warn!("unparseable or empty plan, using code fallback");
                Ok(fallback_plan(task))
            }
        }
    }

    /// Generate the source for a new tool. The artifact protocol: a Python
    /// script reading a JSON params object on stdin and printing a JSON
    /// result object on stdout.
    pub async fn generate_tool_source(
        &self,
        spec: &ToolSpec,
        cancel: Option<CancellationToken>,
    ) -> LlmResult<String> {
        let system = "You are a code generation expert. Generate a safe, self-contained \
             Python 3 script implementing the described tool.\n\
             SECURITY REQUIREMENTS:\n\
             1. NEVER use os.system, subprocess, eval, exec, or __import__\n\
             2. NEVER access the file system unless the tool's purpose requires it\n\
             3. NEVER make network requests unless the tool's purpose is network access\n\
             4. Validate and sanitize all input parameters\n\
             PROTOCOL:\n\
             - read a JSON object of parameters from stdin: params = json.load(sys.stdin)\n\
             - compute the result according to the tool description\n\
             - print exactly one JSON object to stdout: json.dumps({\"result\": ...})\n\
             Output ONLY the script body, no markdown fences, no commentary.";
        let prompt = format!(
            "Tool name: {}\nDescription: {}\nParameters: {}\nImplementation approach: {}\n\n\
             Generate the script:",
            spec.name, spec.description, spec.parameters, spec.approach
        );

        let text = self
            .complete(system, &prompt, 0.2, self.max_tokens, cancel)
            .await?;
        Ok(strip_code_fences(&text).trim().to_string())
    }

    /// Safety-gate generated source. Anything other than an explicit SAFE
    /// or UNSAFE verdict is Unclear.
    pub async fn validate_source_safety(
        &self,
        source: &str,
        cancel: Option<CancellationToken>,
    ) -> LlmResult<SafetyVerdict> {
        let system = "You are a code security expert. Analyze the given code for security \
             risks: file system access, command execution, code injection \
             (eval/exec/__import__), network access, resource exhaustion.\n\
             Focus on actual risks, not keyword presence.\n\
             Respond with ONLY 'SAFE' or 'UNSAFE' followed by a brief reason.";
        let prompt = format!(
            "Analyze this code for security. It will be executed with \
             user-provided parameters:\n\n{}",
            source
        );

        let text = self.complete(system, &prompt, 0.1, 100, cancel).await?;
        let verdict = strip_code_fences(&text).trim().to_uppercase();

        Ok(if verdict.starts_with("SAFE") {
            SafetyVerdict::Safe
        } else if verdict.starts_with("UNSAFE") {
            warn!("safety gate rejected source: {}", verdict);
            SafetyVerdict::Unsafe
        } else {
            let snippet: String = verdict.chars().take(80).collect();
            warn!("unclear safety verdict: {}", snippet);
            SafetyVerdict::Unclear
        })
    }

    /// Synthesize the final prose answer from the per-step results.
    pub async fn synthesize_result(
        &self,
        task: &str,
        step_results: &[StepResult],
        plan: &Plan,
        cancel: Option<CancellationToken>,
    ) -> LlmResult<String> {
        let system = "You are an AI assistant combining tool outputs into one coherent \
             response. Keep the answer concise, highlight the important \
             information, and if a tool failed explain why and suggest an \
             alternative.";
        let results_json =
            serde_json::to_string_pretty(step_results).unwrap_or_else(|_| "[]".to_string());
        let prompt = format!(
            "Task: {}\nPlan: {}\nTool results:\n{}\n\nWrite the final answer:",
            task, plan.description, results_json
        );

        self.complete(system, &prompt, 0.5, self.max_tokens, cancel)
            .await
    }

    /// Score the quality of a final result in [0, 1]. On parse failure, a
    /// length/failure-token heuristic stands in.
    pub async fn score_quality(
        &self,
        result_text: &str,
        cancel: Option<CancellationToken>,
    ) -> LlmResult<f64> {
        let system = "Rate the quality of this task result from 0.0 (useless) to 1.0 \
             (excellent). Consider completeness, accuracy and clarity.\n\
             Respond with ONLY the number.";
        let text = self
            .complete(system, result_text, 0.1, 20, cancel)
            .await?;

        Ok(match extract_float(&text) {
            Some(score) => score.clamp(0.0, 1.0),
            None => {
                debug!("unparseable quality score, applying heuristic");
                heuristic_quality(result_text)
            }
        })
    }
}

/// The documented plan fallback: one code-execution step over the raw task.
pub fn fallback_plan(task: &str) -> Plan {
    Plan {
        description: "direct execution fallback".to_string(),
        steps: vec![PlanStep::new(
            "code",
            serde_json::json!({
                "code": format!("# task: {}\nprint({:?})", task, task),
            }),
            "planner output was unusable; running the raw task through the code tool",
        )],
    }
}

/// Remove a surrounding markdown code fence, if present.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json", "python", ...) up to the first newline.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// Extract and deserialize the outermost JSON object embedded in `text`.
fn parse_json_object<T: serde::de::DeserializeOwned>(text: &str) -> Option<T> {
    let cleaned = strip_code_fences(text);
    if let Ok(value) = serde_json::from_str(cleaned) {
        return Some(value);
    }
    let start = cleaned.find('{')?;
    let end = cleaned.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&cleaned[start..=end]).ok()
}

fn extract_float(text: &str) -> Option<f64> {
    let re = regex::Regex::new(r"\d+(?:\.\d+)?").ok()?;
    re.find(strip_code_fences(text))?.as_str().parse().ok()
}

/// Rule-of-thumb score when the model refuses to produce a number.
fn heuristic_quality(result: &str) -> f64 {
    let lower = result.to_lowercase();
    let mut score: f64 = 0.5;
    if result.len() > 200 {
        score += 0.2;
    }
    if lower.contains("error") || lower.contains("failed") {
        score -= 0.3;
    }
    score.clamp(0.0, 1.0)
}
