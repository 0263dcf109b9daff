//! Gateway server: event WebSocket plus the tool/task control routes.

use crate::ws::ws_handler;
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use selfforge_core::EventBus;
use selfforge_engine::TaskEngine;
use selfforge_llm::ToolSpec;
use selfforge_tools::{ToolRegistry, ToolSynthesizer};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

pub struct GatewayState {
    pub engine: Arc<TaskEngine>,
    pub registry: Arc<ToolRegistry>,
    pub synthesizer: Arc<ToolSynthesizer>,
    pub bus: EventBus,
    pub started_at: std::time::Instant,
}

pub async fn serve(state: Arc<GatewayState>, port: u16) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/ws", get(ws_handler))
        .route("/tasks", post(execute_task_handler))
        .route("/tools", get(list_tools_handler).post(create_tool_handler))
        .route(
            "/tools/:name",
            get(tool_info_handler).delete(delete_tool_handler),
        )
        .route("/tools/:name/test", post(test_tool_handler))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .with_state(state);

    let bind_addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
    info!("gateway listening on {}", bind_addr);
    info!("  event stream: ws://{}/ws", bind_addr);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "tools_loaded": state.registry.loaded_count().await,
        "subscribers": state.bus.subscriber_count(),
    }))
}

async fn status_handler(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    Json(state.engine.evolution_status().await)
}

#[derive(Deserialize)]
struct TaskRequest {
    description: String,
}

async fn execute_task_handler(
    State(state): State<Arc<GatewayState>>,
    Json(request): Json<TaskRequest>,
) -> Json<Value> {
    let outcome = state
        .engine
        .execute_task(&request.description, CancellationToken::new())
        .await;
    Json(serde_json::to_value(&outcome).unwrap_or_default())
}

async fn list_tools_handler(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    let names = state.registry.list().await;
    let mut tools = Vec::with_capacity(names.len());
    for name in names {
        if let Some(meta) = state.registry.metadata(&name).await {
            tools.push(tool_info_json(&state, meta).await);
        }
    }
    Json(json!({ "tools": tools }))
}

async fn tool_info_handler(
    State(state): State<Arc<GatewayState>>,
    AxumPath(name): AxumPath<String>,
) -> Result<Json<Value>, StatusCode> {
    match state.registry.metadata(&name).await {
        Some(meta) => Ok(Json(tool_info_json(&state, meta).await)),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn tool_info_json(
    state: &Arc<GatewayState>,
    meta: selfforge_tools::ToolMetadata,
) -> Value {
    let loaded = state.registry.get(&meta.name).await.is_some();
    json!({
        "name": meta.name,
        "description": meta.description,
        "category": meta.category,
        "aliases": meta.aliases,
        "enabled": meta.enabled,
        "auto_load": meta.auto_load,
        "version": meta.version,
        "author": meta.author,
        "dependencies": meta.dependencies,
        "parameters_schema": meta.parameters_schema,
        "status": format!("{:?}", meta.status),
        "last_error": meta.last_error,
        "loaded": loaded,
    })
}

async fn create_tool_handler(
    State(state): State<Arc<GatewayState>>,
    Json(spec): Json<ToolSpec>,
) -> Result<Json<Value>, (StatusCode, String)> {
    match state.synthesizer.create(spec, false, None).await {
        Ok(result) => Ok(Json(json!({
            "name": result.name,
            "safety_fallback": result.safety_fallback,
        }))),
        Err(e) => Err((StatusCode::UNPROCESSABLE_ENTITY, e.to_string())),
    }
}

async fn delete_tool_handler(
    State(state): State<Arc<GatewayState>>,
    AxumPath(name): AxumPath<String>,
) -> Result<Json<Value>, (StatusCode, String)> {
    match state.registry.remove(&name).await {
        Ok(removed) => Ok(Json(json!({ "removed": removed }))),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

async fn test_tool_handler(
    State(state): State<Arc<GatewayState>>,
    AxumPath(name): AxumPath<String>,
    Json(params): Json<Value>,
) -> Json<Value> {
    let args = match params {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    let started = std::time::Instant::now();
    let output = state
        .registry
        .execute(&name, args, CancellationToken::new())
        .await;
    let result = output.into_step_result(&name, started.elapsed().as_millis() as u64);
    Json(serde_json::to_value(&result).unwrap_or_default())
}
