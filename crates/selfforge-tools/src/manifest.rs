//! Tool manifest — the source of truth for the registry.
//!
//! A JSON document with two top-level keys: `tools` (canonical name ->
//! metadata) and `settings`. Writes go through a temp file and a rename so
//! readers never observe a torn file.

use crate::tool::ParamSchema;
use chrono::{DateTime, Utc};
use selfforge_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Runtime status of a registry entry. Not serialized into the manifest.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ToolStatus {
    #[default]
    Discovered,
    Loaded,
    Error,
    Disabled,
    Unloaded,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_author() -> String {
    "unknown".to_string()
}

fn default_true() -> bool {
    true
}

fn default_category() -> String {
    "general".to_string()
}

/// A tool as seen by the registry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Constructor key resolved by the registry factory.
    pub class_ref: String,
    /// Locator for the code artifact (path for dynamic tools).
    #[serde(default)]
    pub module_ref: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub auto_load: bool,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_author")]
    pub author: String,
    /// External executables that must resolve on PATH before load.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub parameters_schema: ParamSchema,
    #[serde(skip)]
    pub status: ToolStatus,
    #[serde(skip)]
    pub last_error: Option<String>,
    /// Set when a disable removed a live instance, so a later enable can
    /// restore the tool even when `auto_load` is false.
    #[serde(skip)]
    pub was_loaded: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub last_modified: DateTime<Utc>,
}

impl ToolMetadata {
    pub fn new(name: impl Into<String>, class_ref: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            description: String::new(),
            class_ref: class_ref.into(),
            module_ref: String::new(),
            aliases: Vec::new(),
            category: default_category(),
            enabled: true,
            auto_load: true,
            version: default_version(),
            author: default_author(),
            dependencies: Vec::new(),
            parameters_schema: ParamSchema::new(),
            status: ToolStatus::Discovered,
            last_error: None,
            was_loaded: false,
            created_at: now,
            last_modified: now,
        }
    }

    /// One catalog line for the planner prompt.
    pub fn summary_line(&self) -> String {
        let params: Vec<String> = self
            .parameters_schema
            .iter()
            .map(|(name, spec)| {
                let req = if spec.required { "required" } else { "optional" };
                format!("{} ({:?}, {})", name, spec.kind, req)
            })
            .collect();
        let mut line = format!("- {}: {}", self.name, self.description);
        if !self.aliases.is_empty() {
            line.push_str(&format!(" [aliases: {}]", self.aliases.join(", ")));
        }
        if !params.is_empty() {
            line.push_str(&format!(" | params: {}", params.join(", ")));
        }
        line
    }
}

/// Registry settings stored alongside the tools.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistrySettings {
    #[serde(default = "default_true")]
    pub hot_reload: bool,
    #[serde(default = "default_true")]
    pub default_auto_load: bool,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            hot_reload: true,
            default_auto_load: true,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ToolManifest {
    #[serde(default)]
    pub tools: BTreeMap<String, ToolMetadata>,
    #[serde(default)]
    pub settings: Option<RegistrySettings>,
}

impl ToolManifest {
    pub fn settings(&self) -> RegistrySettings {
        self.settings.unwrap_or_default()
    }

    /// Read and parse the manifest. A missing file is an `Io` error the
    /// caller may choose to tolerate; invalid JSON is `ManifestParse`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut manifest: ToolManifest = serde_json::from_str(&raw)
            .map_err(|e| Error::ManifestParse(format!("{}: {}", path.display(), e)))?;
        // Canonical-name keying: the map key wins over any divergent name field.
        for (key, meta) in manifest.tools.iter_mut() {
            meta.name = key.clone();
        }
        Ok(manifest)
    }

    /// Atomically serialize to `path` (write-to-temp + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let serialized = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serialized)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{ParamKind, ParamSpec};

    fn temp_path(name: &str) -> std::path::PathBuf {
        let id = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("selfforge-manifest-{}-{}-{}.json", std::process::id(), id, name))
    }

    fn sample_manifest() -> ToolManifest {
        let mut manifest = ToolManifest::default();
        let mut meta = ToolMetadata::new("terminal", "TerminalTool");
        meta.description = "Run shell commands".to_string();
        meta.aliases = vec!["shell".to_string()];
        meta.parameters_schema.insert(
            "command".to_string(),
            ParamSpec::required(ParamKind::String, "the command"),
        );
        manifest.tools.insert("terminal".to_string(), meta);
        manifest.settings = Some(RegistrySettings::default());
        manifest
    }

    #[test]
    fn save_load_roundtrip() {
        let path = temp_path("roundtrip");
        let manifest = sample_manifest();
        manifest.save(&path).unwrap();

        let loaded = ToolManifest::load(&path).unwrap();
        assert_eq!(loaded.tools.len(), 1);
        let meta = &loaded.tools["terminal"];
        assert_eq!(meta.name, "terminal");
        assert_eq!(meta.aliases, vec!["shell"]);
        assert!(meta.enabled);
        assert_eq!(meta.parameters_schema["command"].kind, ParamKind::String);
        assert_eq!(loaded.settings(), RegistrySettings::default());

        // Second save is byte-stable modulo nothing: keys are ordered maps.
        let again = temp_path("roundtrip2");
        loaded.save(&again).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            std::fs::read_to_string(&again).unwrap()
        );

        std::fs::remove_file(&path).ok();
        std::fs::remove_file(&again).ok();
    }

    #[test]
    fn runtime_fields_not_serialized() {
        let mut manifest = sample_manifest();
        manifest.tools.get_mut("terminal").unwrap().status = ToolStatus::Loaded;
        let json = serde_json::to_string(&manifest).unwrap();
        assert!(!json.contains("status"));
        assert!(!json.contains("last_error"));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = ToolManifest::load(Path::new("/nonexistent/manifest.json")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn invalid_json_is_parse_error() {
        let path = temp_path("invalid");
        std::fs::write(&path, "{not json").unwrap();
        let err = ToolManifest::load(&path).unwrap_err();
        assert!(matches!(err, Error::ManifestParse(_)));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn map_key_overrides_name_field() {
        let path = temp_path("key-wins");
        std::fs::write(
            &path,
            r#"{"tools": {"canonical": {"name": "other", "class_ref": "X"}}}"#,
        )
        .unwrap();
        let manifest = ToolManifest::load(&path).unwrap();
        assert_eq!(manifest.tools["canonical"].name, "canonical");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn summary_line_mentions_params_and_aliases() {
        let manifest = sample_manifest();
        let line = manifest.tools["terminal"].summary_line();
        assert!(line.contains("terminal"));
        assert!(line.contains("shell"));
        assert!(line.contains("command"));
        assert!(line.contains("required"));
    }
}
