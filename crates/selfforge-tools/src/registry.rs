//! Manifest-backed tool registry
//!
//! The live catalogue: metadata table, alias map and instance table behind
//! a single RwLock. Mutations take the exclusive lock; lookups take the
//! shared lock, so a reader sees either the pre-transition or the
//! post-transition instance, never a half-initialized one. Every state
//! transition publishes a `registry_changed` event.

use crate::manifest::{RegistrySettings, ToolManifest, ToolMetadata, ToolStatus};
use crate::tool::{validate_params, ParamSchema, Tool, ToolOutput};
use selfforge_core::{Error, Event, EventBus, RegistryChangeKind, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Builds a live tool from its metadata record.
pub type Constructor = Arc<dyn Fn(&ToolMetadata) -> Result<Arc<dyn Tool>> + Send + Sync>;

#[derive(Default)]
struct RegistryState {
    metadata: HashMap<String, ToolMetadata>,
    aliases: HashMap<String, String>,
    instances: HashMap<String, Arc<dyn Tool>>,
    settings: RegistrySettings,
}

impl RegistryState {
    fn resolve(&self, name: &str) -> Option<String> {
        if self.metadata.contains_key(name) {
            return Some(name.to_string());
        }
        self.aliases.get(name).cloned()
    }

    fn insert_aliases(&mut self, canonical: &str, aliases: &mut Vec<String>) {
        // Each alias belongs to exactly one tool; colliding aliases are dropped.
        aliases.retain(|alias| {
            if alias == canonical {
                return false;
            }
            match self.aliases.get(alias) {
                Some(owner) if owner != canonical => {
                    warn!("alias '{}' already owned by '{}', dropping", alias, owner);
                    false
                }
                _ => {
                    self.aliases.insert(alias.clone(), canonical.to_string());
                    true
                }
            }
        });
    }

    fn remove_aliases(&mut self, canonical: &str) {
        self.aliases.retain(|_, owner| owner != canonical);
    }
}

pub struct ToolRegistry {
    manifest_path: PathBuf,
    state: RwLock<RegistryState>,
    constructors: HashMap<String, Constructor>,
    bus: EventBus,
}

impl ToolRegistry {
    pub fn new(manifest_path: impl Into<PathBuf>, bus: EventBus) -> Self {
        Self {
            manifest_path: manifest_path.into(),
            state: RwLock::new(RegistryState::default()),
            constructors: HashMap::new(),
            bus,
        }
    }

    /// Register a constructor under its class_ref key. Call before sharing
    /// the registry.
    pub fn register_constructor(
        &mut self,
        class_ref: impl Into<String>,
        constructor: Constructor,
    ) {
        self.constructors.insert(class_ref.into(), constructor);
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    fn emit(&self, kind: RegistryChangeKind, tool_name: &str, details: impl Into<String>) {
        self.bus.publish(Event::RegistryChanged {
            kind,
            tool_name: tool_name.to_string(),
            details: details.into(),
        });
    }

    /// Read the manifest and reconcile live state with it.
    ///
    /// Newly-disabled entries are unloaded; new entries with
    /// `auto_load && enabled` are loaded immediately. A momentarily absent
    /// file (the atomic-rename window) is tolerated. On a parse error the
    /// prior state is retained and a `parse_error` event is emitted.
    pub async fn load_manifest(&self) -> Result<()> {
        if !self.manifest_path.exists() {
            debug!("manifest absent at {}, skipping", self.manifest_path.display());
            return Ok(());
        }

        let manifest = match ToolManifest::load(&self.manifest_path) {
            Ok(m) => m,
            Err(Error::Io(e)) => {
                warn!("manifest read race, retaining state: {}", e);
                return Ok(());
            }
            Err(e) => {
                self.emit(RegistryChangeKind::ParseError, "", e.to_string());
                return Err(e);
            }
        };

        let mut to_load = Vec::new();
        let mut to_cleanup: Vec<(String, Arc<dyn Tool>)> = Vec::new();

        {
            let mut st = self.state.write().await;
            st.settings = manifest.settings();

            for (name, mut incoming) in manifest.tools {
                match st.metadata.remove(&name) {
                    Some(existing) => {
                        incoming.status = existing.status;
                        incoming.last_error = existing.last_error;
                        incoming.was_loaded = existing.was_loaded;

                        if !incoming.enabled {
                            if let Some(instance) = st.instances.remove(&name) {
                                to_cleanup.push((name.clone(), instance));
                                incoming.was_loaded = true;
                            }
                            incoming.status = ToolStatus::Disabled;
                        } else if !st.instances.contains_key(&name) {
                            // Re-enabled via manifest edit
                            if incoming.status == ToolStatus::Disabled {
                                incoming.status = ToolStatus::Unloaded;
                            }
                            if incoming.auto_load || incoming.was_loaded {
                                to_load.push(name.clone());
                            }
                            incoming.was_loaded = false;
                        }

                        st.remove_aliases(&name);
                        let mut aliases = incoming.aliases.clone();
                        st.insert_aliases(&name, &mut aliases);
                        incoming.aliases = aliases;
                        st.metadata.insert(name, incoming);
                    }
                    None => {
                        let mut aliases = incoming.aliases.clone();
                        st.insert_aliases(&name, &mut aliases);
                        incoming.aliases = aliases;
                        if incoming.enabled && incoming.auto_load {
                            to_load.push(name.clone());
                        }
                        if !incoming.enabled {
                            incoming.status = ToolStatus::Disabled;
                        }
                        st.metadata.insert(name, incoming);
                    }
                }
            }
        }

        for (name, instance) in to_cleanup {
            instance.cleanup().await;
            info!("unloaded '{}' (disabled via manifest)", name);
            self.emit(RegistryChangeKind::Unloaded, &name, "disabled via manifest");
        }

        for name in to_load {
            if let Err(e) = self.load(&name).await {
                warn!("auto-load of '{}' failed: {}", name, e);
            }
        }

        Ok(())
    }

    /// Serialize current metadata back to the manifest file atomically.
    pub async fn save_manifest(&self) -> Result<()> {
        let snapshot = {
            let st = self.state.read().await;
            ToolManifest {
                tools: st
                    .metadata
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                settings: Some(st.settings),
            }
        };
        snapshot.save(&self.manifest_path)
    }

    /// Resolve a name or alias to the canonical tool name.
    pub async fn resolve(&self, name: &str) -> Option<String> {
        self.state.read().await.resolve(name)
    }

    /// Live instance lookup. Resolves aliases first.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let st = self.state.read().await;
        let canonical = st.resolve(name)?;
        st.instances.get(&canonical).cloned()
    }

    pub async fn metadata(&self, name: &str) -> Option<ToolMetadata> {
        let st = self.state.read().await;
        let canonical = st.resolve(name)?;
        st.metadata.get(&canonical).cloned()
    }

    pub async fn schema_for(&self, name: &str) -> Option<ParamSchema> {
        self.metadata(name).await.map(|m| m.parameters_schema)
    }

    pub async fn list(&self) -> Vec<String> {
        let st = self.state.read().await;
        let mut names: Vec<String> = st.metadata.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn loaded_count(&self) -> usize {
        self.state.read().await.instances.len()
    }

    pub async fn settings(&self) -> RegistrySettings {
        self.state.read().await.settings
    }

    /// Catalog summary for the planner: enabled tools only.
    pub async fn catalog_summary(&self) -> String {
        let st = self.state.read().await;
        let mut entries: Vec<&ToolMetadata> =
            st.metadata.values().filter(|m| m.enabled).collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
            .iter()
            .map(|m| m.summary_line())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Load a tool. Idempotent: an already-loaded tool returns its existing
    /// instance without a second event.
    pub async fn load(&self, name: &str) -> Result<Arc<dyn Tool>> {
        let mut st = self.state.write().await;
        let canonical = st
            .resolve(name)
            .ok_or_else(|| Error::UnknownTool(name.to_string()))?;

        if let Some(instance) = st.instances.get(&canonical) {
            return Ok(instance.clone());
        }

        let Some(meta) = st.metadata.get(&canonical).cloned() else {
            return Err(Error::UnknownTool(canonical));
        };

        if !meta.enabled {
            return Err(Error::tool_exec(&canonical, "tool is disabled"));
        }

        for dep in &meta.dependencies {
            if !dependency_resolves(dep) {
                let err = Error::MissingDependency(dep.clone());
                if let Some(m) = st.metadata.get_mut(&canonical) {
                    m.status = ToolStatus::Error;
                    m.last_error = Some(err.to_string());
                }
                return Err(err);
            }
        }

        let constructor = match self.constructors.get(&meta.class_ref) {
            Some(c) => c.clone(),
            None => {
                let err = Error::tool_exec(
                    &canonical,
                    format!("no constructor for class '{}'", meta.class_ref),
                );
                if let Some(m) = st.metadata.get_mut(&canonical) {
                    m.status = ToolStatus::Error;
                    m.last_error = Some(err.to_string());
                }
                return Err(err);
            }
        };

        match constructor(&meta) {
            Ok(instance) => {
                st.instances.insert(canonical.clone(), instance.clone());
                if let Some(m) = st.metadata.get_mut(&canonical) {
                    m.status = ToolStatus::Loaded;
                    m.last_error = None;
                }
                drop(st);
                info!("loaded tool '{}'", canonical);
                self.emit(RegistryChangeKind::Loaded, &canonical, "");
                Ok(instance)
            }
            Err(e) => {
                if let Some(m) = st.metadata.get_mut(&canonical) {
                    m.status = ToolStatus::Error;
                    m.last_error = Some(e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Unload a tool. Idempotent; cleanup is best-effort.
    pub async fn unload(&self, name: &str) -> Result<()> {
        let removed = {
            let mut st = self.state.write().await;
            let Some(canonical) = st.resolve(name) else {
                return Ok(());
            };
            match st.instances.remove(&canonical) {
                Some(instance) => {
                    if let Some(m) = st.metadata.get_mut(&canonical) {
                        m.status = if m.enabled {
                            ToolStatus::Unloaded
                        } else {
                            ToolStatus::Disabled
                        };
                    }
                    Some((canonical, instance))
                }
                None => None,
            }
        };

        if let Some((canonical, instance)) = removed {
            instance.cleanup().await;
            info!("unloaded tool '{}'", canonical);
            self.emit(RegistryChangeKind::Unloaded, &canonical, "");
        }
        Ok(())
    }

    /// Unload then load in one exclusive section. Readers see the old
    /// instance or, after the unload commits, nothing until the load
    /// commits; never an intermediate.
    pub async fn reload(&self, name: &str) -> Result<Arc<dyn Tool>> {
        let mut st = self.state.write().await;
        let canonical = st
            .resolve(name)
            .ok_or_else(|| Error::UnknownTool(name.to_string()))?;

        let old = st.instances.remove(&canonical);
        let Some(meta) = st.metadata.get(&canonical).cloned() else {
            return Err(Error::UnknownTool(canonical));
        };

        if !meta.enabled {
            if let Some(m) = st.metadata.get_mut(&canonical) {
                m.status = ToolStatus::Disabled;
            }
            drop(st);
            if let Some(old) = old {
                old.cleanup().await;
            }
            return Err(Error::tool_exec(&canonical, "tool is disabled"));
        }

        let rebuilt = self
            .constructors
            .get(&meta.class_ref)
            .ok_or_else(|| {
                Error::tool_exec(
                    &canonical,
                    format!("no constructor for class '{}'", meta.class_ref),
                )
            })
            .and_then(|ctor| ctor(&meta));

        match rebuilt {
            Ok(instance) => {
                st.instances.insert(canonical.clone(), instance.clone());
                if let Some(m) = st.metadata.get_mut(&canonical) {
                    m.status = ToolStatus::Loaded;
                    m.last_error = None;
                }
                drop(st);
                if let Some(old) = old {
                    old.cleanup().await;
                }
                info!("reloaded tool '{}'", canonical);
                self.emit(RegistryChangeKind::Reloaded, &canonical, "");
                Ok(instance)
            }
            Err(e) => {
                if let Some(m) = st.metadata.get_mut(&canonical) {
                    m.status = ToolStatus::Error;
                    m.last_error = Some(e.to_string());
                }
                drop(st);
                if let Some(old) = old {
                    old.cleanup().await;
                }
                self.emit(RegistryChangeKind::Unloaded, &canonical, "reload failed");
                Err(e)
            }
        }
    }

    pub async fn enable(&self, name: &str) -> Result<()> {
        let (canonical, resume) = {
            let mut st = self.state.write().await;
            let canonical = st
                .resolve(name)
                .ok_or_else(|| Error::UnknownTool(name.to_string()))?;
            let Some(meta) = st.metadata.get_mut(&canonical) else {
                return Err(Error::UnknownTool(canonical));
            };
            meta.enabled = true;
            if meta.status == ToolStatus::Disabled {
                meta.status = ToolStatus::Unloaded;
            }
            // Restore a tool that was live when it was disabled, even when
            // auto_load is off.
            let resume = meta.auto_load || meta.was_loaded;
            meta.was_loaded = false;
            (canonical, resume)
        };

        self.save_manifest().await?;
        self.emit(RegistryChangeKind::Enabled, &canonical, "");

        if resume {
            if let Err(e) = self.load(&canonical).await {
                warn!("load after enable of '{}' failed: {}", canonical, e);
            }
        }
        Ok(())
    }

    pub async fn disable(&self, name: &str) -> Result<()> {
        let (canonical, instance) = {
            let mut st = self.state.write().await;
            let canonical = st
                .resolve(name)
                .ok_or_else(|| Error::UnknownTool(name.to_string()))?;
            let had_instance = st.instances.contains_key(&canonical);
            let Some(meta) = st.metadata.get_mut(&canonical) else {
                return Err(Error::UnknownTool(canonical));
            };
            meta.enabled = false;
            meta.status = ToolStatus::Disabled;
            meta.was_loaded = had_instance;
            (canonical.clone(), st.instances.remove(&canonical))
        };

        if let Some(instance) = instance {
            instance.cleanup().await;
            self.emit(RegistryChangeKind::Unloaded, &canonical, "disabled");
        }
        self.save_manifest().await?;
        self.emit(RegistryChangeKind::Disabled, &canonical, "");
        Ok(())
    }

    /// Insert a new metadata record. Fails on name collision unless
    /// `replace` targets the same canonical name.
    pub async fn add(&self, mut meta: ToolMetadata, replace: bool) -> Result<()> {
        {
            let mut st = self.state.write().await;
            if st.metadata.contains_key(&meta.name) && !replace {
                return Err(Error::AlreadyRegistered(meta.name));
            }
            if replace {
                st.remove_aliases(&meta.name);
            }
            let canonical = meta.name.clone();
            let mut aliases = meta.aliases.clone();
            st.insert_aliases(&canonical, &mut aliases);
            meta.aliases = aliases;
            st.metadata.insert(canonical, meta.clone());
        }
        self.save_manifest().await?;
        self.emit(RegistryChangeKind::Added, &meta.name, "");
        Ok(())
    }

    /// Unload and delete a tool. Aliases pointing at it are cleared;
    /// dynamic artifacts are removed best-effort.
    pub async fn remove(&self, name: &str) -> Result<bool> {
        let removed = {
            let mut st = self.state.write().await;
            let Some(canonical) = st.resolve(name) else {
                return Ok(false);
            };
            let instance = st.instances.remove(&canonical);
            let meta = st.metadata.remove(&canonical);
            st.remove_aliases(&canonical);
            meta.map(|m| (canonical, m, instance))
        };

        let Some((canonical, meta, instance)) = removed else {
            return Ok(false);
        };

        if let Some(instance) = instance {
            instance.cleanup().await;
        }
        if meta.category == "dynamic" && !meta.module_ref.is_empty() {
            let artifact = PathBuf::from(&meta.module_ref);
            if std::fs::remove_file(&artifact).is_ok() {
                let _ = std::fs::remove_file(artifact.with_extension("meta.json"));
            }
        }
        self.save_manifest().await?;
        info!("removed tool '{}'", canonical);
        self.emit(RegistryChangeKind::Removed, &canonical, "");
        Ok(true)
    }

    /// Load every enabled auto_load tool. Per-tool failures are isolated
    /// and leave that tool in Error status. Returns the number loaded.
    pub async fn load_autoload(&self) -> usize {
        let candidates: Vec<String> = {
            let st = self.state.read().await;
            st.metadata
                .values()
                .filter(|m| m.enabled && m.auto_load && !st.instances.contains_key(&m.name))
                .map(|m| m.name.clone())
                .collect()
        };

        let mut loaded = 0;
        for name in candidates {
            match self.load(&name).await {
                Ok(_) => loaded += 1,
                Err(e) => warn!("auto-load of '{}' failed: {}", name, e),
            }
        }
        loaded
    }

    /// Validate and execute by name, with cancellation. Convenience for
    /// the control surface's test-tool operation.
    pub async fn execute(
        &self,
        name: &str,
        args: Map<String, Value>,
        cancel: CancellationToken,
    ) -> ToolOutput {
        let Some(canonical) = self.resolve(name).await else {
            return ToolOutput::failure(format!("unknown tool: {}", name));
        };
        let Some(tool) = self.get(&canonical).await else {
            return ToolOutput::failure(format!("tool not loaded: {}", canonical));
        };
        let schema = self
            .schema_for(&canonical)
            .await
            .unwrap_or_default();
        let validated = match validate_params(&args, &schema) {
            Ok(v) => v,
            Err(e) => return ToolOutput::failure(e.to_string()),
        };
        tool.execute_cancellable(validated, cancel).await
    }
}

/// A dependency resolves iff it names an executable reachable on PATH
/// (or an existing path when given one).
pub fn dependency_resolves(dep: &str) -> bool {
    if dep.contains('/') {
        return Path::new(dep).exists();
    }
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(dep).is_file())
}
