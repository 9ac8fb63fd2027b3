//! Backhaul Agent
//!
//! Connects to the coordinator, executes the work units dispatched to this
//! agent key, and ships telemetry back in batches.

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use backhaul_agent::config::Config;
use backhaul_agent::connection::AgentConnection;
use backhaul_agent::executor::AgentExecutor;
use backhaul_agent::telemetry::TelemetryBuffer;
use backhaul_core::adapter::AdapterRegistry;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "backhaul_agent=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Backhaul Agent...");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("invalid configuration: {:#}", e);
            std::process::exit(1);
        }
    };
    tracing::info!(
        "agent '{}' targeting coordinator {}",
        config.agent_key,
        config.coordinator_addr
    );

    let registry = Arc::new(AdapterRegistry::standard());
    let telemetry = Arc::new(TelemetryBuffer::new(config.chunk_size));
    let executor = Arc::new(AgentExecutor::with_timings(
        registry,
        Arc::clone(&telemetry),
        config.default_task_timeout,
        std::time::Duration::from_secs(30),
    ));

    let connection = Arc::new(AgentConnection::new(config, executor, telemetry));
    connection.run().await;
}
