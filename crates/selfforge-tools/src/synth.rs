//! Tool synthesizer — materializes a new tool from an LLM-produced spec.
//!
//! Source generation and the safety gate both go through the LLM gate.
//! Rejected or unclear source is replaced by a minimal stub so the workflow
//! survives with no functionality; that substitution is logged loudly.

use crate::manifest::ToolMetadata;
use crate::registry::ToolRegistry;
use crate::tool::{ParamSchema, Tool};
use crate::tools::dynamic::ArtifactRecord;
use chrono::Utc;
use selfforge_core::{Error, Event, EventBus, RegistryChangeKind, Result};
use selfforge_llm::{LlmGate, SafetyVerdict, ToolSpec};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug)]
pub struct SynthesizedTool {
    pub tool: Arc<dyn Tool>,
    pub name: String,
    pub safety_fallback: bool,
}

pub struct ToolSynthesizer {
    gate: Arc<LlmGate>,
    registry: Arc<ToolRegistry>,
    tools_dir: PathBuf,
    bus: EventBus,
}

impl ToolSynthesizer {
    pub fn new(
        gate: Arc<LlmGate>,
        registry: Arc<ToolRegistry>,
        tools_dir: impl Into<PathBuf>,
        bus: EventBus,
    ) -> Self {
        Self {
            gate,
            registry,
            tools_dir: tools_dir.into(),
            bus,
        }
    }

    /// Create, persist, register and load a new tool.
    pub async fn create(
        &self,
        spec: ToolSpec,
        allow_replace: bool,
        cancel: Option<CancellationToken>,
    ) -> Result<SynthesizedTool> {
        let name = sanitize_name(&spec.name);
        if name.is_empty() {
            return Err(Error::SynthesisFailed("empty tool name".to_string()));
        }

        if !allow_replace && self.registry.resolve(&name).await.is_some() {
            return Err(Error::AlreadyRegistered(name));
        }

        // Source generation. LLM unavailable here means nothing is written.
        let generated = self
            .gate
            .generate_tool_source(&spec, cancel.clone())
            .await
            .map_err(|e| Error::SynthesisFailed(format!("source generation: {}", e)))?;

        // Safety gate. Unclear counts as unsafe; if the gate itself is
        // unreachable, fall back to a conservative token scan.
        let verdict = match self.gate.validate_source_safety(&generated, cancel).await {
            Ok(v) => v,
            Err(e) => {
                warn!("safety gate unreachable ({}), applying basic scan", e);
                basic_safety_scan(&generated)
            }
        };

        let (source, safety_fallback) = if verdict.is_safe() {
            (generated, false)
        } else {
            warn!(
                "SAFETY FALLBACK: generated source for '{}' rejected ({:?}); \
                 installing echo stub",
                name, verdict
            );
            (stub_source(&spec), true)
        };

        let artifact = self.write_artifacts(&name, &source, &spec, safety_fallback)?;

        let meta = build_metadata(&name, &spec, &artifact);
        if let Err(e) = self.registry.add(meta, allow_replace).await {
            self.emit_failure(&name, &e);
            return Err(e);
        }
        let tool = match self.registry.load(&name).await {
            Ok(tool) => tool,
            Err(e) => {
                // Artifact stays on disk for inspection; metadata load failed.
                self.emit_failure(&name, &e);
                return Err(e);
            }
        };

        info!(
            "synthesized tool '{}' ({})",
            name,
            if safety_fallback { "safety stub" } else { "live source" }
        );

        Ok(SynthesizedTool {
            tool,
            name,
            safety_fallback,
        })
    }

    /// Write the artifact pair atomically: script + sidecar metadata with
    /// counters initialized to zero.
    fn write_artifacts(
        &self,
        name: &str,
        source: &str,
        spec: &ToolSpec,
        safety_fallback: bool,
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.tools_dir)?;
        let artifact = self.tools_dir.join(format!("{}.py", name));

        let tmp = artifact.with_extension("py.tmp");
        std::fs::write(&tmp, source)?;
        std::fs::rename(&tmp, &artifact)?;

        let record = ArtifactRecord {
            name: name.to_string(),
            description: spec.description.clone(),
            parameters: spec.parameters.clone(),
            approach: spec.approach.clone(),
            safety_fallback,
            created_at: Utc::now(),
            uses: 0,
            successes: 0,
        };
        record.save(&artifact)?;
        Ok(artifact)
    }

    /// Re-register artifacts present on disk but absent from the registry
    /// (e.g. after manifest loss). The sidecar record reconstructs the
    /// metadata. Returns the number of tools recovered.
    pub async fn recover_artifacts(&self) -> usize {
        let mut recovered = 0;
        let walker = walkdir::WalkDir::new(&self.tools_dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok());

        for entry in walker {
            let path = entry.path();
            if !path.extension().is_some_and(|e| e == "py") {
                continue;
            }
            let Ok(record) = ArtifactRecord::load(path) else {
                warn!("artifact {} has no readable sidecar, skipping", path.display());
                continue;
            };
            if self.registry.resolve(&record.name).await.is_some() {
                continue;
            }

            let spec = ToolSpec {
                name: record.name.clone(),
                description: record.description.clone(),
                parameters: record.parameters.clone(),
                approach: record.approach.clone(),
            };
            let meta = build_metadata(&record.name, &spec, path);
            if let Err(e) = self.registry.add(meta, false).await {
                warn!("failed to re-register artifact '{}': {}", record.name, e);
                continue;
            }
            if let Err(e) = self.registry.load(&record.name).await {
                warn!("failed to load recovered tool '{}': {}", record.name, e);
                continue;
            }
            info!("recovered dynamic tool '{}' from {}", record.name, path.display());
            recovered += 1;
        }
        recovered
    }

    fn emit_failure(&self, name: &str, error: &Error) {
        self.bus.publish(Event::RegistryChanged {
            kind: RegistryChangeKind::SynthesisFailed,
            tool_name: name.to_string(),
            details: error.to_string(),
        });
    }
}

fn build_metadata(name: &str, spec: &ToolSpec, artifact: &Path) -> ToolMetadata {
    let mut meta = ToolMetadata::new(name, "DynamicTool");
    meta.description = spec.description.clone();
    meta.module_ref = artifact.to_string_lossy().to_string();
    meta.category = "dynamic".to_string();
    meta.author = "selfforge".to_string();
    meta.dependencies = vec!["python3".to_string()];
    meta.parameters_schema =
        serde_json::from_value::<ParamSchema>(spec.parameters.clone()).unwrap_or_default();
    meta
}

/// Lowercase, keep [a-z0-9_], collapse everything else to '_'.
fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    cleaned.trim_matches('_').to_string()
}

/// The minimal stub: echoes one parameter's length. Preserves the workflow
/// while delivering no functionality.
fn stub_source(spec: &ToolSpec) -> String {
    let first_param = spec
        .parameters
        .as_object()
        .and_then(|m| m.keys().next().cloned())
        .unwrap_or_else(|| "input".to_string());
    format!(
        "import json\nimport sys\n\nparams = json.load(sys.stdin)\nvalue = str(params.get(\"{}\", \"\"))\nprint(json.dumps({{\"result\": len(value), \"safety_fallback\": True}}))\n",
        first_param
    )
}

/// Conservative token scan used only when the LLM safety gate is down.
fn basic_safety_scan(source: &str) -> SafetyVerdict {
    const DENIED: &[&str] = &[
        "os.system",
        "subprocess",
        "eval(",
        "exec(",
        "__import__",
        "socket",
        "shutil.rmtree",
    ];
    if DENIED.iter().any(|token| source.contains(token)) {
        SafetyVerdict::Unsafe
    } else {
        SafetyVerdict::Unclear
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_name_normalizes() {
        assert_eq!(sanitize_name("Time Tool"), "time_tool");
        assert_eq!(sanitize_name("  weather-api  "), "weather_api");
        assert_eq!(sanitize_name("___"), "");
    }

    #[test]
    fn stub_echoes_first_parameter() {
        let spec = ToolSpec {
            name: "t".into(),
            description: "d".into(),
            parameters: json!({"city": {"type": "string", "required": true}}),
            approach: String::new(),
        };
        let stub = stub_source(&spec);
        assert!(stub.contains("params.get(\"city\""));
        assert!(stub.contains("len(value)"));
        assert!(!stub.contains("subprocess"));
    }

    #[test]
    fn basic_scan_flags_dangerous_tokens() {
        assert_eq!(
            basic_safety_scan("import subprocess\nsubprocess.run(['ls'])"),
            SafetyVerdict::Unsafe
        );
        assert_eq!(
            basic_safety_scan("x = eval(input())"),
            SafetyVerdict::Unsafe
        );
        // Clean code is still only Unclear: the scan cannot certify safety.
        assert_eq!(
            basic_safety_scan("print('hello')"),
            SafetyVerdict::Unclear
        );
    }
}
