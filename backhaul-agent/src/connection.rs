//! Coordinator connection
//!
//! The agent dials the coordinator and keeps one duplex connection open for
//! its whole life: announces itself, fetches its assignment, serves
//! coordinator-initiated requests, and lets the telemetry flusher push
//! batches upstream. A lost connection tears everything attached to it down
//! and the outer loop redials after a fixed backoff.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use backhaul_core::rpc::{
    Assignment, CompleteEvent, CorrelationTable, Envelope, ProgressEvent, RpcCall, RpcError,
    read_frame, write_frame,
};

use crate::config::Config;
use crate::executor::AgentExecutor;
use crate::telemetry::{TelemetryBuffer, TelemetryTransport};

/// Issues requests over the connection's writer channel and waits for the
/// correlated response.
#[derive(Clone)]
pub struct RequestSender {
    tx: mpsc::UnboundedSender<Envelope>,
    correlation: Arc<CorrelationTable>,
    deadline: Duration,
}

impl RequestSender {
    pub async fn call(&self, call: RpcCall) -> Result<Option<Value>, RpcError> {
        let txn = Uuid::new_v4();
        self.correlation.register(txn);
        if self.tx.send(Envelope::Request { txn, call }).is_err() {
            self.correlation.forget(txn);
            return Err(RpcError::Transport(
                "connection writer is gone".to_string(),
            ));
        }
        self.correlation.wait(txn, self.deadline).await
    }
}

/// Telemetry transport backed by the live connection.
struct WireTelemetry {
    sender: RequestSender,
}

#[async_trait]
impl TelemetryTransport for WireTelemetry {
    async fn send_progress(&self, events: Vec<ProgressEvent>) -> Result<(), RpcError> {
        self.sender
            .call(RpcCall::UpdateProgress { events })
            .await
            .map(|_| ())
    }

    async fn send_complete(&self, events: Vec<CompleteEvent>) -> Result<(), RpcError> {
        self.sender
            .call(RpcCall::UpdateComplete { events })
            .await
            .map(|_| ())
    }
}

pub struct AgentConnection {
    config: Config,
    executor: Arc<AgentExecutor>,
    telemetry: Arc<TelemetryBuffer>,
}

impl AgentConnection {
    pub fn new(
        config: Config,
        executor: Arc<AgentExecutor>,
        telemetry: Arc<TelemetryBuffer>,
    ) -> Self {
        Self {
            config,
            executor,
            telemetry,
        }
    }

    /// Connect-serve-backoff loop; never returns.
    pub async fn run(self: Arc<Self>) {
        loop {
            match TcpStream::connect(&self.config.coordinator_addr).await {
                Ok(stream) => {
                    info!("connected to coordinator at {}", self.config.coordinator_addr);
                    if let Err(e) = self.serve_connection(stream).await {
                        warn!("connection lost: {}", e);
                    }
                }
                Err(e) => {
                    warn!(
                        "could not reach coordinator at {}: {}",
                        self.config.coordinator_addr, e
                    );
                }
            }
            debug!("reconnecting in {:?}", self.config.reconnect_backoff);
            tokio::time::sleep(self.config.reconnect_backoff).await;
        }
    }

    async fn serve_connection(&self, stream: TcpStream) -> anyhow::Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let correlation = Arc::new(CorrelationTable::new());
        let sender = RequestSender {
            tx: tx.clone(),
            correlation: Arc::clone(&correlation),
            deadline: self.config.rpc_timeout,
        };

        let writer = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if write_frame(&mut write_half, &envelope).await.is_err() {
                    break;
                }
            }
        });

        // Handshake and assignment fetch run alongside the read loop; their
        // responses come back through the correlation table.
        let init = {
            let sender = sender.clone();
            let executor = Arc::clone(&self.executor);
            let agent_key = self.config.agent_key.clone();
            tokio::spawn(async move {
                if let Err(e) = announce_and_fetch(&sender, &executor, &agent_key).await {
                    warn!("could not initialize connection: {}", e);
                }
            })
        };

        let flusher = self.telemetry.spawn_flusher(
            Arc::new(WireTelemetry {
                sender: sender.clone(),
            }),
            self.config.flush_interval,
            self.config.send_deadline,
        );

        let outcome = loop {
            match read_frame(&mut reader).await {
                Ok(Some(Envelope::Response { txn, result, error })) => {
                    correlation.insert(txn, result, error);
                }
                Ok(Some(Envelope::Request { txn, call })) => {
                    debug!("serving {} request", call.method());
                    let reply = match self.handle_request(call).await {
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
                        break Err(anyhow::anyhow!("connection writer stopped"));
                    }
                }
                Ok(None) => break Err(anyhow::anyhow!("coordinator closed the connection")),
                Err(e) => break Err(anyhow::Error::from(e).context("read failed")),
            }
        };

        flusher.abort();
        init.abort();
        writer.abort();
        outcome
    }

    async fn handle_request(&self, call: RpcCall) -> Result<Option<Value>, String> {
        match call {
            RpcCall::Run {
                work_unit,
                previous,
            } => {
                self.executor.handle_run(work_unit, previous).await?;
                Ok(Some(serde_json::json!("accepted")))
            }
            RpcCall::Stop { work_unit_id } => {
                self.executor.handle_stop(work_unit_id);
                Ok(Some(serde_json::json!("ok")))
            }
            RpcCall::TestConnection { kind, settings } => {
                let message = self.executor.test_connection(kind, &settings).await?;
                Ok(Some(serde_json::json!(message)))
            }
            RpcCall::ListDatabases { kind, settings } => {
                let names = self.executor.list_databases(kind, &settings).await?;
                serde_json::to_value(names).map(Some).map_err(|e| e.to_string())
            }
            other => Err(format!("unsupported method {}", other.method())),
        }
    }
}

/// Announces the agent and installs the fetched assignment.
async fn announce_and_fetch(
    sender: &RequestSender,
    executor: &AgentExecutor,
    agent_key: &str,
) -> anyhow::Result<()> {
    sender
        .call(RpcCall::Connect {
            agent_key: agent_key.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
        .await?;
    info!("announced as agent '{}'", agent_key);

    let value = sender
        .call(RpcCall::FetchAssignment {
            agent_key: agent_key.to_string(),
        })
        .await?
        .ok_or_else(|| anyhow::anyhow!("assignment response carried no payload"))?;
    let assignment: Assignment = serde_json::from_value(value)?;
    info!(
        "assignment covers {} pipeline(s)",
        assignment.pipelines.len()
    );
    executor.set_assignment(assignment);
    Ok(())
}
