//! Agent connection server
//!
//! Accepts the persistent duplex connection each agent holds open. The
//! first frame must announce the agent's identity; after that the read
//! loop routes `Response` frames into the hub's result table and serves
//! agent-initiated requests (assignment fetches and telemetry batches).

use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use backhaul_core::domain::{Agent, AgentStatus};
use backhaul_core::rpc::{Assignment, Envelope, RpcCall, read_frame, write_frame};

use crate::engine::JobRunEngine;
use crate::hub::RpcHub;
use crate::repository::Repository;

pub struct AgentServer {
    hub: Arc<RpcHub>,
    engine: Arc<JobRunEngine>,
    repo: Arc<dyn Repository>,
}

impl AgentServer {
    pub fn new(hub: Arc<RpcHub>, engine: Arc<JobRunEngine>, repo: Arc<dyn Repository>) -> Self {
        Self { hub, engine, repo }
    }

    /// Accept loop; one task per agent connection.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!("agent server listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("incoming agent connection from {}", peer);
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                server.handle_connection(stream).await;
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // The handshake frame carries the agent's identity and version.
        let (connect_txn, agent_key, version) = match read_frame(&mut reader).await {
            Ok(Some(Envelope::Request {
                txn,
                call: RpcCall::Connect { agent_key, version },
            })) => (txn, agent_key, version),
            Ok(other) => {
                warn!("connection did not start with Connect, dropping ({:?})", other);
                return;
            }
            Err(e) => {
                warn!("failed to read handshake: {}", e);
                return;
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let conn_id = self.hub.register(&agent_key, &version, tx.clone());
        self.record_agent(&agent_key, &version, AgentStatus::Online).await;

        // Single writer per connection; everything outbound goes through tx.
        let writer = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if write_frame(&mut write_half, &envelope).await.is_err() {
                    break;
                }
            }
        });

        let _ = tx.send(Envelope::Response {
            txn: connect_txn,
            result: Some(serde_json::json!("connected")),
            error: None,
        });

        loop {
            match read_frame(&mut reader).await {
                Ok(Some(Envelope::Response { txn, result, error })) => {
                    self.hub.complete_txn(txn, result, error);
                }
                Ok(Some(Envelope::Request { txn, call })) => {
                    let reply = match self.handle_request(&agent_key, call).await {
                        Ok(result) => Envelope::Response {
                            txn,
                            result,
                            error: None,
                        },
                        Err(message) => Envelope::Response {
                            txn,
                            result: None,
                            error: Some(message),
                        },
                    };
                    if tx.send(reply).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("agent '{}' closed the connection", agent_key);
                    break;
                }
                Err(e) => {
                    warn!("read error on connection of '{}': {}", agent_key, e);
                    break;
                }
            }
        }

        self.hub.deregister(&agent_key, conn_id);
        self.record_agent(&agent_key, &version, AgentStatus::Offline).await;
        writer.abort();
    }

    async fn handle_request(
        &self,
        agent_key: &str,
        call: RpcCall,
    ) -> Result<Option<serde_json::Value>, String> {
        match call {
            RpcCall::FetchAssignment { agent_key: key } => {
                let agent = self
                    .repo
                    .find_agent(&key)
                    .await
                    .map_err(|e| e.to_string())?
                    .unwrap_or_else(|| Agent::new(key.clone(), None));
                let pipelines = self
                    .repo
                    .list_active_pipelines()
                    .await
                    .map_err(|e| e.to_string())?
                    .into_iter()
                    .filter(|p| p.stages.iter().any(|s| s.agent_key == key))
                    .collect();
                let assignment = Assignment { agent, pipelines };
                serde_json::to_value(assignment)
                    .map(Some)
                    .map_err(|e| e.to_string())
            }
            RpcCall::UpdateProgress { events } => {
                self.engine.progress(&events);
                Ok(Some(serde_json::json!("ok")))
            }
            RpcCall::UpdateComplete { events } => {
                self.engine.complete_batch(&events).await;
                Ok(Some(serde_json::json!("ok")))
            }
            other => {
                warn!(
                    "agent '{}' sent unsupported method {}",
                    agent_key,
                    other.method()
                );
                Err(format!("unsupported method {}", other.method()))
            }
        }
    }

    async fn record_agent(&self, agent_key: &str, version: &str, status: AgentStatus) {
        let agent = match self.repo.find_agent(agent_key).await {
            Ok(Some(mut existing)) => {
                existing.version = Some(version.to_string());
                existing.status = status;
                if status == AgentStatus::Online {
                    existing.last_connected_at = chrono::Utc::now();
                }
                existing
            }
            Ok(None) => {
                let mut agent = Agent::new(agent_key, Some(version.to_string()));
                agent.status = status;
                agent
            }
            Err(e) => {
                warn!("could not load agent '{}': {}", agent_key, e);
                return;
            }
        };
        if let Err(e) = self.repo.upsert_agent(agent).await {
            warn!("could not record agent '{}': {}", agent_key, e);
        }
    }
}
