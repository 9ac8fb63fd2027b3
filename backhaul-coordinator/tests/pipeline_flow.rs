//! End-to-end flow over a real socket: coordinator and agent processes
//! wired together in-process, exchanging the same frames they would in
//! production. Exercises run expansion, dispatch, adapter execution on the
//! agent, batched telemetry, and finalization.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use backhaul_agent::config::Config as AgentConfig;
use backhaul_agent::connection::AgentConnection;
use backhaul_agent::executor::AgentExecutor;
use backhaul_agent::telemetry::TelemetryBuffer;
use backhaul_core::adapter::AdapterRegistry;
use backhaul_core::domain::{Pipeline, Stage, TaskKind};
use backhaul_coordinator::engine::JobRunEngine;
use backhaul_coordinator::hub::RpcHub;
use backhaul_coordinator::repository::{MemoryRepository, Repository};
use backhaul_coordinator::server::AgentServer;

const AGENT_KEY: &str = "vault-1";

fn backup_pipeline(output_dir: &str, blocks: u64, block_delay_ms: Option<u64>) -> Pipeline {
    let pipeline_id = Uuid::new_v4();

    let mut dump_settings = HashMap::new();
    dump_settings.insert("databases".to_string(), serde_json::json!(["sales", "orders"]));
    dump_settings.insert("output_dir".to_string(), serde_json::json!(output_dir));
    dump_settings.insert("blocks".to_string(), serde_json::json!(blocks));
    if let Some(delay) = block_delay_ms {
        dump_settings.insert("block_delay_ms".to_string(), serde_json::json!(delay));
    }
    let dump = Stage {
        id: Uuid::new_v4(),
        pipeline_id,
        kind: TaskKind::CreateBackup,
        stage_order: 0,
        parallel: 2,
        upstream_stage_id: None,
        timeout_seconds: None,
        settings: dump_settings,
        agent_key: AGENT_KEY.to_string(),
    };
    let compress = Stage {
        id: Uuid::new_v4(),
        pipeline_id,
        kind: TaskKind::Compress,
        stage_order: 1,
        parallel: 2,
        upstream_stage_id: Some(dump.id),
        timeout_seconds: None,
        settings: HashMap::new(),
        agent_key: AGENT_KEY.to_string(),
    };

    Pipeline {
        id: pipeline_id,
        name: "nightly".to_string(),
        schedule: None,
        priority: 0,
        active: true,
        stages: vec![dump, compress],
    }
}

struct Cluster {
    engine: Arc<JobRunEngine>,
    repo: Arc<dyn Repository>,
    hub: Arc<RpcHub>,
    executor: Arc<AgentExecutor>,
}

/// Starts a coordinator on an ephemeral port and one agent dialing it.
async fn start_cluster(pipeline: Pipeline) -> Cluster {
    let registry = Arc::new(AdapterRegistry::standard());
    let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
    repo.insert_pipeline(pipeline).await.unwrap();

    let hub = Arc::new(RpcHub::with_timings(
        Duration::from_secs(5),
        Duration::from_millis(10),
    ));
    let engine = Arc::new(JobRunEngine::with_lock_timeout(
        Arc::clone(&repo),
        hub.clone(),
        Arc::clone(&registry),
        Duration::from_secs(2),
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(AgentServer::new(
        Arc::clone(&hub),
        Arc::clone(&engine),
        Arc::clone(&repo),
    ));
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    let config = AgentConfig {
        agent_key: AGENT_KEY.to_string(),
        coordinator_addr: addr.to_string(),
        default_task_timeout: Duration::from_secs(60),
        reconnect_backoff: Duration::from_millis(200),
        flush_interval: Duration::from_millis(50),
        chunk_size: 100,
        send_deadline: Duration::from_millis(500),
        rpc_timeout: Duration::from_secs(5),
    };
    let telemetry = Arc::new(TelemetryBuffer::new(config.chunk_size));
    let executor = Arc::new(AgentExecutor::with_timings(
        registry,
        Arc::clone(&telemetry),
        config.default_task_timeout,
        Duration::from_secs(5),
    ));
    let connection = Arc::new(AgentConnection::new(
        config,
        Arc::clone(&executor),
        telemetry,
    ));
    tokio::spawn(async move {
        connection.run().await;
    });

    let cluster = Cluster {
        engine,
        repo,
        hub,
        executor,
    };
    cluster.wait_for_agent().await;
    cluster
}

impl Cluster {
    /// Waits until the agent is registered and holds its assignment.
    async fn wait_for_agent(&self) {
        for _ in 0..1000 {
            if self.hub.is_connected(AGENT_KEY) && self.executor.has_assignment() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("agent never finished connecting");
    }

    async fn wait_for_run_completion(&self, run_id: Uuid) -> backhaul_core::domain::JobRun {
        for _ in 0..2000 {
            let run = self.repo.find_run(run_id).await.unwrap().unwrap();
            if run.completed_at.is_some() {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {} never completed", run_id);
    }
}

#[tokio::test]
async fn test_two_stage_pipeline_completes_over_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = backup_pipeline(&dir.path().to_string_lossy(), 2, None);
    let pipeline_id = pipeline.id;
    let cluster = start_cluster(pipeline).await;

    let run_id = cluster.engine.setup_job_run(pipeline_id).await.unwrap();
    let run = cluster.wait_for_run_completion(run_id).await;

    assert!(!run.is_error);
    assert!(!run.stopped);
    assert_eq!(run.result_message.as_deref(), Some("4 tasks completed"));

    let units = cluster.repo.work_units_for_run(run_id).await.unwrap();
    assert_eq!(units.len(), 4);
    for unit in &units {
        assert!(unit.completed_at.is_some());
        assert!(!unit.is_error, "unit '{}' failed: {:?}", unit.item_name, unit.result_message);
    }

    // Each compressed artifact chains on the same item's dump.
    let compressed: Vec<_> = units.iter().filter(|u| u.stage_order == 1).collect();
    assert_eq!(compressed.len(), 2);
    for unit in compressed {
        let artifact = unit.result_artifact.as_deref().expect("compressed artifact");
        assert!(artifact.ends_with(".cmp"));
        assert!(artifact.contains(&unit.item_name));
        assert!(std::path::Path::new(artifact).exists());
    }
}

#[tokio::test]
async fn test_stop_cancels_in_flight_work_over_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    // Slow dumps so the stop lands while stage 0 is running.
    let pipeline = backup_pipeline(&dir.path().to_string_lossy(), 100, Some(50));
    let pipeline_id = pipeline.id;
    let cluster = start_cluster(pipeline).await;

    let run_id = cluster.engine.setup_job_run(pipeline_id).await.unwrap();

    for _ in 0..500 {
        if cluster.executor.in_flight_count() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(cluster.executor.in_flight_count() > 0, "no work reached the agent");

    cluster.engine.stop_job_run(run_id).await.unwrap();
    let run = cluster.wait_for_run_completion(run_id).await;

    assert!(run.stopped);
    assert!(run.is_error);

    let units = cluster.repo.work_units_for_run(run_id).await.unwrap();
    assert_eq!(units.len(), 4);
    for unit in &units {
        assert!(unit.completed_at.is_some());
        assert!(unit.is_error);
        assert_eq!(unit.result_message.as_deref(), Some("stopped by request"));
    }

    // The agent releases its cancelled work.
    for _ in 0..500 {
        if cluster.executor.in_flight_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(cluster.executor.in_flight_count(), 0);
}
