//! Tests for selfforge-tools: registry lifecycle, manifest reconcile,
//! watcher hot-reload, and the builtin tools against the real filesystem.

use selfforge_core::{Event, EventBus, RegistryChangeKind};
use selfforge_tools::*;
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn test_workspace() -> PathBuf {
    let id = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "selfforge-tools-test-{}-{}",
        std::process::id(),
        id
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn cleanup(dir: &std::path::Path) {
    let _ = std::fs::remove_dir_all(dir);
}

fn args(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    match value {
        serde_json::Value::Object(map) => map,
        _ => panic!("expected object"),
    }
}

/// A tool whose cleanup calls are counted, for lifecycle assertions.
#[derive(Debug)]
struct CountingTool {
    cleanups: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Tool for CountingTool {
    fn name(&self) -> &str {
        "counting"
    }
    fn description(&self) -> &str {
        "test tool"
    }
    async fn execute(&self, _params: serde_json::Map<String, serde_json::Value>) -> ToolOutput {
        ToolOutput::success(json!({"ok": true}))
    }
    async fn cleanup(&self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

/// Registry over a seeded manifest plus the counting test tool.
async fn registry_with_counting(
    ws: &std::path::Path,
    bus: EventBus,
) -> (Arc<ToolRegistry>, Arc<AtomicUsize>) {
    let manifest_path = ws.join("manifest.json");
    let mut manifest = default_manifest();
    let mut meta = ToolMetadata::new("counting", "CountingTool");
    meta.aliases = vec!["tally".to_string()];
    meta.category = "builtin".to_string();
    manifest.tools.insert("counting".to_string(), meta);
    manifest.save(&manifest_path).unwrap();

    let cleanups = Arc::new(AtomicUsize::new(0));
    let counter = cleanups.clone();
    let mut registry = create_builtin_registry(&manifest_path, ws, bus);
    registry.register_constructor(
        "CountingTool",
        Arc::new(move |_| {
            Ok(Arc::new(CountingTool {
                cleanups: counter.clone(),
            }) as Arc<dyn Tool>)
        }),
    );
    let registry = Arc::new(registry);
    registry.load_manifest().await.unwrap();
    (registry, cleanups)
}

fn drain(stream: &mut selfforge_core::EventStream) -> Vec<Event> {
    let mut events = Vec::new();
    while let Some(e) = stream.try_next() {
        events.push(e);
    }
    events
}

fn count_kind(events: &[Event], kind: RegistryChangeKind, tool: &str) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, Event::RegistryChanged { kind: k, tool_name, .. } if *k == kind && tool_name == tool))
        .count()
}

// ===========================================================================
// Resolution and lifecycle
// ===========================================================================

#[tokio::test]
async fn manifest_load_populates_and_autoloads() {
    let ws = test_workspace();
    let (registry, _) = registry_with_counting(&ws, EventBus::new(64)).await;

    let names = registry.list().await;
    assert!(names.contains(&"terminal".to_string()));
    assert!(names.contains(&"code".to_string()));
    assert!(names.contains(&"counting".to_string()));

    // auto_load && enabled means a live instance exists
    assert!(registry.get("counting").await.is_some());
    assert!(registry.get("terminal").await.is_some());
    cleanup(&ws);
}

#[tokio::test]
async fn alias_resolution() {
    let ws = test_workspace();
    let (registry, _) = registry_with_counting(&ws, EventBus::new(64)).await;

    assert_eq!(registry.resolve("counting").await.as_deref(), Some("counting"));
    assert_eq!(registry.resolve("tally").await.as_deref(), Some("counting"));
    assert_eq!(registry.resolve("shell").await.as_deref(), Some("terminal"));
    assert_eq!(registry.resolve("nonexistent").await, None);

    // get through an alias returns the canonical instance
    assert!(registry.get("tally").await.is_some());
    cleanup(&ws);
}

#[tokio::test]
async fn double_load_is_idempotent_with_one_event() {
    let ws = test_workspace();
    let bus = EventBus::new(64);
    let (registry, _) = registry_with_counting(&ws, bus.clone()).await;
    let mut stream = bus.subscribe();

    registry.unload("counting").await.unwrap();
    drain(&mut stream);

    let first = registry.load("counting").await.unwrap();
    let second = registry.load("counting").await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let events = drain(&mut stream);
    assert_eq!(count_kind(&events, RegistryChangeKind::Loaded, "counting"), 1);
    cleanup(&ws);
}

#[tokio::test]
async fn unload_invokes_cleanup_and_is_idempotent() {
    let ws = test_workspace();
    let bus = EventBus::new(64);
    let (registry, cleanups) = registry_with_counting(&ws, bus.clone()).await;
    let mut stream = bus.subscribe();

    registry.unload("counting").await.unwrap();
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    assert!(registry.get("counting").await.is_none());

    // Second unload is a no-op: no cleanup, no event
    registry.unload("counting").await.unwrap();
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);

    let events = drain(&mut stream);
    assert_eq!(count_kind(&events, RegistryChangeKind::Unloaded, "counting"), 1);
    cleanup(&ws);
}

#[tokio::test]
async fn reload_returns_distinct_instance() {
    let ws = test_workspace();
    let (registry, cleanups) = registry_with_counting(&ws, EventBus::new(64)).await;

    let before = registry.get("counting").await.unwrap();
    let after = registry.reload("counting").await.unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    // the old instance was cleaned up
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    cleanup(&ws);
}

#[tokio::test]
async fn disable_unloads_and_enable_restores() {
    let ws = test_workspace();
    let bus = EventBus::new(64);
    let (registry, _) = registry_with_counting(&ws, bus.clone()).await;
    let mut stream = bus.subscribe();

    registry.disable("counting").await.unwrap();
    assert!(registry.get("counting").await.is_none());
    assert!(!registry.metadata("counting").await.unwrap().enabled);

    // loading a disabled tool is refused
    assert!(registry.load("counting").await.is_err());

    registry.enable("counting").await.unwrap();
    // auto_load is respected: the tool comes back loaded
    assert!(registry.get("counting").await.is_some());

    let events = drain(&mut stream);
    assert_eq!(count_kind(&events, RegistryChangeKind::Disabled, "counting"), 1);
    assert_eq!(count_kind(&events, RegistryChangeKind::Enabled, "counting"), 1);
    cleanup(&ws);
}

#[tokio::test]
async fn enable_restores_manually_loaded_tool_without_autoload() {
    let ws = test_workspace();
    let (registry, _) = registry_with_counting(&ws, EventBus::new(64)).await;

    let mut meta = ToolMetadata::new("manual", "CountingTool");
    meta.auto_load = false;
    registry.add(meta, false).await.unwrap();
    assert!(registry.get("manual").await.is_none());

    // Loaded by hand, so disable/enable must bring it back even though
    // auto_load is off.
    registry.load("manual").await.unwrap();
    registry.disable("manual").await.unwrap();
    assert!(registry.get("manual").await.is_none());
    registry.enable("manual").await.unwrap();
    assert!(registry.get("manual").await.is_some());

    // Not loaded at disable time: enable leaves it unloaded.
    registry.unload("manual").await.unwrap();
    registry.disable("manual").await.unwrap();
    registry.enable("manual").await.unwrap();
    assert!(registry.get("manual").await.is_none());
    assert_eq!(
        registry.metadata("manual").await.unwrap().status,
        ToolStatus::Unloaded
    );
    cleanup(&ws);
}

#[tokio::test]
async fn add_rejects_name_collision_unless_replace() {
    let ws = test_workspace();
    let (registry, _) = registry_with_counting(&ws, EventBus::new(64)).await;

    let meta = ToolMetadata::new("counting", "CountingTool");
    let err = registry.add(meta.clone(), false).await.unwrap_err();
    assert!(matches!(err, selfforge_core::Error::AlreadyRegistered(_)));

    registry.add(meta, true).await.unwrap();
    cleanup(&ws);
}

#[tokio::test]
async fn add_drops_alias_owned_by_another_tool() {
    let ws = test_workspace();
    let (registry, _) = registry_with_counting(&ws, EventBus::new(64)).await;

    let mut meta = ToolMetadata::new("other", "CountingTool");
    meta.aliases = vec!["tally".to_string(), "fresh".to_string()];
    registry.add(meta, false).await.unwrap();

    // "tally" still points at the original owner; "fresh" at the new tool
    assert_eq!(registry.resolve("tally").await.as_deref(), Some("counting"));
    assert_eq!(registry.resolve("fresh").await.as_deref(), Some("other"));
    cleanup(&ws);
}

#[tokio::test]
async fn remove_clears_aliases_and_metadata() {
    let ws = test_workspace();
    let (registry, _) = registry_with_counting(&ws, EventBus::new(64)).await;

    assert!(registry.remove("counting").await.unwrap());
    assert_eq!(registry.resolve("counting").await, None);
    assert_eq!(registry.resolve("tally").await, None);
    assert!(registry.get("counting").await.is_none());

    // removing again reports false
    assert!(!registry.remove("counting").await.unwrap());
    cleanup(&ws);
}

#[tokio::test]
async fn catalog_summary_lists_enabled_only() {
    let ws = test_workspace();
    let (registry, _) = registry_with_counting(&ws, EventBus::new(64)).await;

    registry.disable("counting").await.unwrap();
    let summary = registry.catalog_summary().await;
    assert!(summary.contains("terminal"));
    assert!(!summary.contains("counting"));
    cleanup(&ws);
}

#[tokio::test]
async fn missing_dependency_sets_error_status() {
    let ws = test_workspace();
    let (registry, _) = registry_with_counting(&ws, EventBus::new(64)).await;

    let mut meta = ToolMetadata::new("needy", "CountingTool");
    meta.dependencies = vec!["definitely-not-a-real-binary-xyz".to_string()];
    registry.add(meta, false).await.unwrap();

    let err = registry.load("needy").await.unwrap_err();
    assert!(matches!(err, selfforge_core::Error::MissingDependency(_)));
    assert_eq!(
        registry.metadata("needy").await.unwrap().status,
        ToolStatus::Error
    );
    assert!(registry.get("needy").await.is_none());
    cleanup(&ws);
}

#[tokio::test]
async fn save_then_load_roundtrips_registry_state() {
    let ws = test_workspace();
    let (registry, _) = registry_with_counting(&ws, EventBus::new(64)).await;
    registry.save_manifest().await.unwrap();

    let manifest = ToolManifest::load(&ws.join("manifest.json")).unwrap();
    assert!(manifest.tools.contains_key("counting"));
    assert!(manifest.tools.contains_key("terminal"));
    assert_eq!(manifest.tools["counting"].aliases, vec!["tally"]);
    cleanup(&ws);
}

// ===========================================================================
// Hot reload via manifest edit (watcher)
// ===========================================================================

#[tokio::test]
async fn manifest_edit_disables_tool_via_watcher() {
    let ws = test_workspace();
    let bus = EventBus::new(64);
    let (registry, _) = registry_with_counting(&ws, bus.clone()).await;
    let mut stream = bus.subscribe();
    drain(&mut stream);

    let shutdown = CancellationToken::new();
    let watcher = ManifestWatcher::new(registry.clone(), std::time::Duration::from_millis(50));
    let handle = tokio::spawn(watcher.run(shutdown.clone()));

    assert!(registry.get("counting").await.is_some());

    // mtime granularity: make sure the rewrite lands strictly later
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let manifest_path = ws.join("manifest.json");
    let mut manifest = ToolManifest::load(&manifest_path).unwrap();
    manifest.tools.get_mut("counting").unwrap().enabled = false;
    manifest.save(&manifest_path).unwrap();

    // within a couple of poll intervals the reconcile lands
    let mut disabled = false;
    for _ in 0..40 {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        if registry.get("counting").await.is_none() {
            disabled = true;
            break;
        }
    }
    assert!(disabled, "watcher never reconciled the disabled tool");
    assert_eq!(
        registry.metadata("counting").await.unwrap().status,
        ToolStatus::Disabled
    );

    let events = drain(&mut stream);
    assert_eq!(count_kind(&events, RegistryChangeKind::Unloaded, "counting"), 1);

    shutdown.cancel();
    let _ = handle.await;
    cleanup(&ws);
}

#[tokio::test]
async fn manifest_parse_error_retains_state() {
    let ws = test_workspace();
    let bus = EventBus::new(64);
    let (registry, _) = registry_with_counting(&ws, bus.clone()).await;
    let mut stream = bus.subscribe();
    drain(&mut stream);

    std::fs::write(ws.join("manifest.json"), "{broken json").unwrap();
    assert!(registry.load_manifest().await.is_err());

    // prior state retained
    assert!(registry.get("counting").await.is_some());
    let events = drain(&mut stream);
    assert!(events.iter().any(|e| matches!(
        e,
        Event::RegistryChanged { kind: RegistryChangeKind::ParseError, .. }
    )));
    cleanup(&ws);
}

// ===========================================================================
// Builtin tools against the real system
// ===========================================================================

#[tokio::test]
async fn terminal_tool_runs_command() {
    let ws = test_workspace();
    std::fs::write(ws.join("hello.txt"), "x").unwrap();
    let tool = TerminalTool::new(&ws);
    let out = tool.execute(args(json!({"command": "ls"}))).await;
    assert!(!out.is_error());
    let step = out.into_step_result("terminal", 0);
    assert!(step.data["stdout"].as_str().unwrap().contains("hello.txt"));
    cleanup(&ws);
}

#[tokio::test]
async fn terminal_tool_nonzero_exit_is_failure() {
    let ws = test_workspace();
    let tool = TerminalTool::new(&ws);
    let out = tool.execute(args(json!({"command": "exit 3"}))).await;
    assert!(out.is_error());
    let step = out.into_step_result("terminal", 0);
    assert!(step.error.contains("3"));
    cleanup(&ws);
}

#[tokio::test]
async fn terminal_tool_denies_destructive_commands() {
    let ws = test_workspace();
    let tool = TerminalTool::new(&ws);
    for command in ["rm -rf /", "chmod 777 /etc/passwd", "chown root file", "sudo id"] {
        let out = tool.execute(args(json!({"command": command}))).await;
        assert!(out.is_error(), "'{}' should be refused", command);
        let step = out.into_step_result("terminal", 0);
        assert!(step.error.contains("not allowed"));
    }
    cleanup(&ws);
}

#[tokio::test]
async fn terminal_tool_timeout() {
    let ws = test_workspace();
    let tool = TerminalTool::new(&ws);
    let out = tool
        .execute(args(json!({"command": "sleep 30", "timeout": 1})))
        .await;
    assert!(out.is_error());
    let step = out.into_step_result("terminal", 0);
    assert!(step.error.contains("timed out"));
    cleanup(&ws);
}

#[tokio::test]
async fn terminal_tool_cancellation_kills_child() {
    let ws = test_workspace();
    let tool = TerminalTool::new(&ws);
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        canceller.cancel();
    });
    let start = std::time::Instant::now();
    let out = tool
        .execute_cancellable(args(json!({"command": "sleep 30"})), cancel)
        .await;
    assert!(start.elapsed() < std::time::Duration::from_secs(5));
    assert!(out.is_error());
    cleanup(&ws);
}

fn has_python3() -> bool {
    dependency_resolves("python3")
}

#[tokio::test]
async fn code_tool_executes_python() {
    if !has_python3() {
        eprintln!("skipping: python3 not on PATH");
        return;
    }
    let tool = CodeTool::new();
    let out = tool
        .execute(args(json!({"code": "print(21 * 2)"})))
        .await;
    assert!(!out.is_error());
    let step = out.into_step_result("code", 0);
    assert_eq!(step.data["stdout"], "42");
}

#[tokio::test]
async fn code_tool_surfaces_exceptions() {
    if !has_python3() {
        eprintln!("skipping: python3 not on PATH");
        return;
    }
    let tool = CodeTool::new();
    let out = tool
        .execute(args(json!({"code": "raise ValueError('boom')"})))
        .await;
    assert!(out.is_error());
    let step = out.into_step_result("code", 0);
    assert!(step.error.contains("boom"));
}

#[tokio::test]
async fn registry_execute_validates_params() {
    let ws = test_workspace();
    let (registry, _) = registry_with_counting(&ws, EventBus::new(64)).await;

    // terminal requires "command"
    let out = registry
        .execute("terminal", args(json!({})), CancellationToken::new())
        .await;
    assert!(out.is_error());

    let out = registry
        .execute("unknown-tool", args(json!({})), CancellationToken::new())
        .await;
    assert!(out.is_error());
    cleanup(&ws);
}
