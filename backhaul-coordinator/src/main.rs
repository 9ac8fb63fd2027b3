//! Backhaul Coordinator
//!
//! Loads the pipeline definitions, opens the agent TCP server and the HTTP
//! API, and drives job runs through the engine as triggers and completions
//! arrive.

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use backhaul_core::adapter::AdapterRegistry;
use backhaul_core::domain::Pipeline;
use backhaul_coordinator::api::{self, AppState};
use backhaul_coordinator::config::Config;
use backhaul_coordinator::engine::JobRunEngine;
use backhaul_coordinator::hub::RpcHub;
use backhaul_coordinator::repository::{MemoryRepository, Repository};
use backhaul_coordinator::server::AgentServer;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "backhaul_coordinator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Backhaul Coordinator...");

    let config = Config::from_env();
    if let Err(e) = config.validate() {
        tracing::error!("invalid configuration: {}", e);
        std::process::exit(1);
    }

    let registry = Arc::new(AdapterRegistry::standard());
    let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());

    if let Some(path) = &config.pipelines_path {
        if let Err(e) = load_pipelines(path, &registry, repo.as_ref()).await {
            tracing::error!("failed to load pipelines from '{}': {}", path, e);
            std::process::exit(1);
        }
    } else {
        tracing::warn!("PIPELINES_PATH not set, starting with no pipeline definitions");
    }

    let hub = Arc::new(RpcHub::new());
    let engine = Arc::new(JobRunEngine::with_lock_timeout(
        Arc::clone(&repo),
        hub.clone(),
        Arc::clone(&registry),
        config.lock_timeout,
    ));

    let agent_listener = tokio::net::TcpListener::bind(&config.agent_bind_addr)
        .await
        .expect("Failed to bind agent server address");
    let server = Arc::new(AgentServer::new(
        Arc::clone(&hub),
        Arc::clone(&engine),
        Arc::clone(&repo),
    ));
    tokio::spawn(async move {
        if let Err(e) = server.serve(agent_listener).await {
            tracing::error!("agent server stopped: {}", e);
        }
    });

    let app = api::create_router(AppState {
        engine,
        repo,
        hub,
    });
    tracing::info!("API listening on {}", config.api_bind_addr);
    let listener = tokio::net::TcpListener::bind(&config.api_bind_addr)
        .await
        .expect("Failed to bind API address");
    axum::serve(listener, app).await.expect("Failed to start API server");
}

/// Loads and validates pipeline definitions from a JSON file.
async fn load_pipelines(
    path: &str,
    registry: &AdapterRegistry,
    repo: &dyn Repository,
) -> Result<(), String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let pipelines: Vec<Pipeline> = serde_json::from_str(&text).map_err(|e| e.to_string())?;

    for pipeline in pipelines {
        pipeline.validate()?;
        registry.validate_pipeline(&pipeline)?;
        tracing::info!(
            "loaded pipeline '{}' with {} stage(s)",
            pipeline.name,
            pipeline.stages.len()
        );
        repo.insert_pipeline(pipeline).await.map_err(|e| e.to_string())?;
    }

    Ok(())
}
