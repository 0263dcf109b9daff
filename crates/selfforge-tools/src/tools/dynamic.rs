//! Dynamic tool — wraps a synthesized artifact script.
//!
//! The artifact protocol: the script reads a JSON object of parameters on
//! stdin and prints a JSON object on stdout. Execution is out-of-process
//! via the interpreter, with kill-on-cancel; no generated code ever runs
//! inside this process.

use crate::manifest::ToolMetadata;
use crate::tool::{ParamSchema, Tool, ToolOutput};
use chrono::{DateTime, Utc};
use selfforge_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Sidecar record persisted next to each artifact.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub approach: String,
    #[serde(default)]
    pub safety_fallback: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub uses: u64,
    #[serde(default)]
    pub successes: u64,
}

impl ArtifactRecord {
    pub fn sidecar_path(artifact: &Path) -> PathBuf {
        artifact.with_extension("meta.json")
    }

    pub fn load(artifact: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(Self::sidecar_path(artifact))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save(&self, artifact: &Path) -> Result<()> {
        let path = Self::sidecar_path(artifact);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct DynamicTool {
    name: String,
    description: String,
    schema: ParamSchema,
    artifact: PathBuf,
    interpreter: String,
    timeout_secs: u64,
    safety_fallback: bool,
}

impl DynamicTool {
    /// Build from a registry metadata record whose `module_ref` points at
    /// the artifact script.
    pub fn from_metadata(meta: &ToolMetadata) -> Result<Self> {
        let artifact = PathBuf::from(&meta.module_ref);
        if !artifact.is_file() {
            return Err(Error::tool_exec(
                &meta.name,
                format!("artifact missing: {}", artifact.display()),
            ));
        }
        let safety_fallback = ArtifactRecord::load(&artifact)
            .map(|r| r.safety_fallback)
            .unwrap_or(false);

        Ok(Self {
            name: meta.name.clone(),
            description: meta.description.clone(),
            schema: meta.parameters_schema.clone(),
            artifact,
            interpreter: "python3".to_string(),
            timeout_secs: 30,
            safety_fallback,
        })
    }

    /// Bump the sidecar usage counters. Best-effort; a racing writer or a
    /// deleted sidecar just loses the tick.
    fn record_usage(&self, success: bool) {
        let Ok(mut record) = ArtifactRecord::load(&self.artifact) else {
            return;
        };
        record.uses += 1;
        if success {
            record.successes += 1;
        }
        if let Err(e) = record.save(&self.artifact) {
            warn!("failed to update usage counters for '{}': {}", self.name, e);
        }
    }
}

#[async_trait::async_trait]
impl Tool for DynamicTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> ParamSchema {
        self.schema.clone()
    }

    fn concurrency_safe(&self) -> bool {
        true
    }

    async fn execute(&self, params: Map<String, Value>) -> ToolOutput {
        self.execute_cancellable(params, CancellationToken::new()).await
    }

    async fn execute_cancellable(
        &self,
        params: Map<String, Value>,
        cancel: CancellationToken,
    ) -> ToolOutput {
        debug!("dynamic tool '{}' executing {}", self.name, self.artifact.display());

        let mut child = match Command::new(&self.interpreter)
            .arg(&self.artifact)
            .kill_on_drop(true)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return ToolOutput::failure(format!("failed to spawn interpreter: {}", e));
            }
        };

        let input = Value::Object(params).to_string();
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                return ToolOutput::failure(format!("failed to write params: {}", e));
            }
            drop(stdin);
        }

        let timeout = std::time::Duration::from_secs(self.timeout_secs);

        let output = tokio::select! {
            result = tokio::time::timeout(timeout, child.wait_with_output()) => {
                match result {
                    Ok(Ok(output)) => output,
                    Ok(Err(e)) => {
                        self.record_usage(false);
                        return ToolOutput::failure(format!("failed to wait: {}", e));
                    }
                    Err(_) => {
                        self.record_usage(false);
                        return ToolOutput::failure(format!(
                            "tool timed out after {}s", self.timeout_secs
                        ));
                    }
                }
            }
            _ = cancel.cancelled() => {
                self.record_usage(false);
                return ToolOutput::failure("cancelled");
            }
        };

        if !output.status.success() {
            self.record_usage(false);
            let stderr = String::from_utf8_lossy(&output.stderr);
            return ToolOutput::failure(format!(
                "exit code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let data = serde_json::from_str::<Value>(stdout.trim())
            .unwrap_or_else(|_| json!({ "result": stdout.trim() }));

        self.record_usage(true);

        let metadata = if self.safety_fallback {
            json!({ "tool_type": "dynamic", "safety_fallback": true })
        } else {
            json!({ "tool_type": "dynamic" })
        };
        ToolOutput::success_with(data, metadata)
    }
}
