//! selfforge — self-evolving agent runtime
//!
//! Usage:
//!   selfforge serve                 → gateway + manifest watcher (default)
//!   selfforge run "<task>"          → execute one task, print the outcome
//!   selfforge tools                 → list the tool catalog
//!
//! Exit codes: 0 on clean shutdown, non-zero on initialization failure
//! (missing credential, unreadable manifest).

use anyhow::Context;
use clap::{Parser, Subcommand};
use selfforge_core::{Config, EventBus};
use selfforge_engine::{EngineConfig, ExperienceStore, TaskEngine};
use selfforge_gateway::GatewayState;
use selfforge_llm::{ChatProvider, LlmGate};
use selfforge_tools::{
    create_builtin_registry, seed_manifest_if_missing, ManifestWatcher, ToolRegistry,
    ToolSynthesizer,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "selfforge",
    about = "Self-evolving agent runtime: plans with an LLM, executes tools, and forges new tools at runtime",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Workspace directory tools operate in (default: current directory)
    #[arg(short, long, global = true)]
    workspace: Option<PathBuf>,

    /// Gateway port (overrides SELFFORGE_PORT)
    #[arg(short, long, global = true)]
    port: Option<u16>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway and the manifest hot-reload watcher
    Serve,
    /// Execute one task and print the outcome as JSON
    Run { task: String },
    /// List the tool catalog
    Tools,
}

struct Runtime {
    engine: Arc<TaskEngine>,
    registry: Arc<ToolRegistry>,
    synthesizer: Arc<ToolSynthesizer>,
    bus: EventBus,
}

async fn init_runtime(config: &Config, workspace: &PathBuf) -> anyhow::Result<Runtime> {
    let bus = EventBus::new(config.bus_capacity);

    let api_key = config
        .require_api_key()
        .context("SELFFORGE_API_KEY not set")?;
    let provider = Arc::new(ChatProvider::new(api_key, &config.base_url));
    let gate = Arc::new(
        LlmGate::new(provider, &config.model)
            .with_sampling(config.temperature, config.max_tokens),
    );

    seed_manifest_if_missing(&config.manifest_path)
        .with_context(|| format!("seeding manifest at {}", config.manifest_path.display()))?;
    let registry = Arc::new(create_builtin_registry(
        &config.manifest_path,
        workspace,
        bus.clone(),
    ));
    registry
        .load_manifest()
        .await
        .with_context(|| format!("reading manifest at {}", config.manifest_path.display()))?;
    info!("tool catalog: {:?}", registry.list().await);

    let synthesizer = Arc::new(ToolSynthesizer::new(
        gate.clone(),
        registry.clone(),
        &config.tools_dir,
        bus.clone(),
    ));
    let recovered = synthesizer.recover_artifacts().await;
    if recovered > 0 {
        info!("recovered {} dynamic tools from artifacts", recovered);
    }

    let store = Arc::new(
        ExperienceStore::open(&config.db_path)
            .await
            .with_context(|| format!("opening experience store at {}", config.db_path.display()))?,
    );

    let engine = Arc::new(TaskEngine::new(
        gate,
        registry.clone(),
        synthesizer.clone(),
        store,
        bus.clone(),
        EngineConfig {
            tool_timeout_secs: config.tool_timeout_secs,
        },
    ));

    Ok(Runtime {
        engine,
        registry,
        synthesizer,
        bus,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    let workspace = match cli.workspace {
        Some(ws) => ws,
        None => std::env::current_dir().context("resolving current directory")?,
    };

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let runtime = init_runtime(&config, &workspace).await?;

            let shutdown = CancellationToken::new();
            if runtime.registry.settings().await.hot_reload {
                let watcher = ManifestWatcher::new(
                    runtime.registry.clone(),
                    std::time::Duration::from_millis(config.watch_interval_ms),
                );
                tokio::spawn(watcher.run(shutdown.clone()));
            }

            let state = Arc::new(GatewayState {
                engine: runtime.engine,
                registry: runtime.registry,
                synthesizer: runtime.synthesizer,
                bus: runtime.bus,
                started_at: std::time::Instant::now(),
            });
            let result = selfforge_gateway::serve(state, config.port).await;
            shutdown.cancel();
            result
        }
        Commands::Run { task } => {
            let runtime = init_runtime(&config, &workspace).await?;
            let outcome = runtime
                .engine
                .execute_task(&task, CancellationToken::new())
                .await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Commands::Tools => {
            let runtime = init_runtime(&config, &workspace).await?;
            for name in runtime.registry.list().await {
                if let Some(meta) = runtime.registry.metadata(&name).await {
                    println!("{}", meta.summary_line());
                }
            }
            Ok(())
        }
    }
}
