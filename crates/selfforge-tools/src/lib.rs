//! selfforge-tools — the dynamic tool registry and everything it catalogs.
//!
//! Tools are addressed by canonical name or alias, described by a JSON
//! manifest, loaded/unloaded at runtime, and extended at runtime by the
//! synthesizer. Each builtin is a self-contained file in src/tools/.

pub mod manifest;
pub mod registry;
pub mod synth;
pub mod tool;
pub mod tools;
pub mod watcher;

pub use manifest::{RegistrySettings, ToolManifest, ToolMetadata, ToolStatus};
pub use registry::{dependency_resolves, Constructor, ToolRegistry};
pub use synth::{SynthesizedTool, ToolSynthesizer};
pub use tool::{validate_params, ParamKind, ParamSchema, ParamSpec, Tool, ToolOutput};
pub use tools::{CodeTool, DynamicTool, TerminalTool, WebReaderTool};
pub use watcher::ManifestWatcher;

use selfforge_core::EventBus;
use std::path::Path;
use std::sync::Arc;

/// Build a registry wired with constructors for every shipped tool class.
///
/// `workspace_root` anchors the terminal tool's working directory.
pub fn create_builtin_registry(
    manifest_path: impl AsRef<Path>,
    workspace_root: impl AsRef<Path>,
    bus: EventBus,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new(manifest_path.as_ref().to_path_buf(), bus);
    let root = workspace_root.as_ref().to_path_buf();

    registry.register_constructor(
        "TerminalTool",
        Arc::new(move |_meta| Ok(Arc::new(TerminalTool::new(&root)) as Arc<dyn Tool>)),
    );
    registry.register_constructor(
        "CodeTool",
        Arc::new(|_meta| Ok(Arc::new(CodeTool::new()) as Arc<dyn Tool>)),
    );
    registry.register_constructor(
        "WebReaderTool",
        Arc::new(|_meta| Ok(Arc::new(WebReaderTool::new()) as Arc<dyn Tool>)),
    );
    registry.register_constructor(
        "DynamicTool",
        Arc::new(|meta| {
            DynamicTool::from_metadata(meta).map(|t| Arc::new(t) as Arc<dyn Tool>)
        }),
    );

    registry
}

/// The manifest written on first start: the builtin tools, enabled and
/// auto-loading.
pub fn default_manifest() -> ToolManifest {
    let mut manifest = ToolManifest {
        settings: Some(RegistrySettings::default()),
        ..Default::default()
    };

    let terminal_schema = TerminalTool::new(".").parameters_schema();
    let mut terminal = ToolMetadata::new("terminal", "TerminalTool");
    terminal.description =
        "Execute a shell command and capture stdout, stderr and the exit code".to_string();
    terminal.aliases = vec!["shell".to_string(), "bash".to_string()];
    terminal.category = "builtin".to_string();
    terminal.dependencies = vec!["sh".to_string()];
    terminal.parameters_schema = terminal_schema;
    manifest.tools.insert("terminal".to_string(), terminal);

    let code_schema = CodeTool::new().parameters_schema();
    let mut code = ToolMetadata::new("code", "CodeTool");
    code.description = "Execute a Python 3 snippet and capture its output".to_string();
    code.aliases = vec!["python".to_string()];
    code.category = "builtin".to_string();
    code.dependencies = vec!["python3".to_string()];
    code.parameters_schema = code_schema;
    manifest.tools.insert("code".to_string(), code);

    let reader_schema = WebReaderTool::new().parameters_schema();
    let mut reader = ToolMetadata::new("web_reader", "WebReaderTool");
    reader.description =
        "Fetch a web page and return its readable text content".to_string();
    reader.aliases = vec!["fetch_url".to_string()];
    reader.category = "search".to_string();
    reader.parameters_schema = reader_schema;
    manifest.tools.insert("web_reader".to_string(), reader);

    manifest
}

/// Seed the default manifest when none exists yet. Returns true if a file
/// was written.
pub fn seed_manifest_if_missing(path: impl AsRef<Path>) -> selfforge_core::Result<bool> {
    let path = path.as_ref();
    if path.exists() {
        return Ok(false);
    }
    default_manifest().save(path)?;
    tracing::info!("seeded default manifest at {}", path.display());
    Ok(true)
}
