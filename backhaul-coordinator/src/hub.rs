//! RPC hub
//!
//! Coordinator side of the agent transport: a registry of live agent
//! connections plus the shared transaction result table. `call` pushes a
//! request over the owning connection and polls the table until the
//! response lands or the round-trip deadline expires. There is no retry:
//! an unregistered agent key fails immediately.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use backhaul_core::domain::WorkUnit;
use backhaul_core::rpc::{ASSIGNMENT_NOT_READY, CorrelationTable, Envelope, RpcCall, RpcError};

/// Seam between the engine and the transport; the engine never sees
/// connections, only this contract.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Dispatches one work unit to the agent owning its stage.
    async fn run(
        &self,
        agent_key: &str,
        unit: &WorkUnit,
        previous: Option<&WorkUnit>,
    ) -> Result<(), RpcError>;

    /// Cancels an in-flight work unit on its agent.
    async fn stop(&self, agent_key: &str, work_unit_id: Uuid) -> Result<(), RpcError>;
}

struct AgentHandle {
    /// Distinguishes reconnects so a stale read loop cannot deregister a
    /// newer connection for the same key.
    conn_id: Uuid,
    version: String,
    tx: mpsc::UnboundedSender<Envelope>,
}

/// Connection registry and request/response correlation.
pub struct RpcHub {
    connections: Mutex<HashMap<String, AgentHandle>>,
    correlation: CorrelationTable,
    rpc_timeout: Duration,
}

impl RpcHub {
    pub fn new() -> Self {
        Self::with_timings(Duration::from_secs(30), Duration::from_millis(100))
    }

    /// Shorter timings keep tests fast; production uses the defaults
    /// (30 s round trip, 100 ms result poll).
    pub fn with_timings(rpc_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            correlation: CorrelationTable::with_poll_interval(poll_interval),
            rpc_timeout,
        }
    }

    /// Registers a live connection for `agent_key`, displacing any previous
    /// one. Returns the connection id the read loop must present to
    /// deregister.
    pub fn register(
        &self,
        agent_key: &str,
        version: &str,
        tx: mpsc::UnboundedSender<Envelope>,
    ) -> Uuid {
        let conn_id = Uuid::new_v4();
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        connections.insert(
            agent_key.to_string(),
            AgentHandle {
                conn_id,
                version: version.to_string(),
                tx,
            },
        );
        tracing::info!("agent '{}' connected (version {})", agent_key, version);
        conn_id
    }

    /// Removes the registration, but only while it still belongs to the
    /// presenting connection.
    pub fn deregister(&self, agent_key: &str, conn_id: Uuid) {
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        if connections.get(agent_key).is_some_and(|h| h.conn_id == conn_id) {
            connections.remove(agent_key);
            tracing::info!("agent '{}' disconnected", agent_key);
        }
    }

    pub fn is_connected(&self, agent_key: &str) -> bool {
        let connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        connections.contains_key(agent_key)
    }

    /// (key, version) pairs of the currently connected agents.
    pub fn connected_agents(&self) -> Vec<(String, String)> {
        let connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        connections
            .iter()
            .map(|(key, handle)| (key.clone(), handle.version.clone()))
            .collect()
    }

    /// Deposits the outcome of a transaction, called by the read loops.
    pub fn complete_txn(&self, txn: Uuid, result: Option<Value>, error: Option<String>) {
        self.correlation.insert(txn, result, error);
    }

    /// Issues one request and waits for its correlated response.
    pub async fn call(&self, agent_key: &str, call: RpcCall) -> Result<Option<Value>, RpcError> {
        let method = call.method();
        let tx = {
            let connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
            connections
                .get(agent_key)
                .map(|handle| handle.tx.clone())
                .ok_or_else(|| RpcError::NotConnected(agent_key.to_string()))?
        };

        let txn = Uuid::new_v4();
        tracing::debug!("sending {} to '{}' (txn {})", method, agent_key, txn);
        self.correlation.register(txn);
        if tx.send(Envelope::Request { txn, call }).is_err() {
            self.correlation.forget(txn);
            return Err(RpcError::Transport(format!(
                "connection to '{}' closed",
                agent_key
            )));
        }

        self.correlation.wait(txn, self.rpc_timeout).await
    }

    pub async fn test_connection(
        &self,
        agent_key: &str,
        kind: backhaul_core::domain::TaskKind,
        settings: HashMap<String, Value>,
    ) -> Result<String, RpcError> {
        let result = self
            .call(agent_key, RpcCall::TestConnection { kind, settings })
            .await?;
        serde_json::from_value(result.unwrap_or(Value::Null))
            .map_err(|e| RpcError::Transport(format!("malformed TestConnection result: {}", e)))
    }

    pub async fn list_databases(
        &self,
        agent_key: &str,
        kind: backhaul_core::domain::TaskKind,
        settings: HashMap<String, Value>,
    ) -> Result<Vec<String>, RpcError> {
        let result = self
            .call(agent_key, RpcCall::ListDatabases { kind, settings })
            .await?;
        serde_json::from_value(result.unwrap_or(Value::Null))
            .map_err(|e| RpcError::Transport(format!("malformed ListDatabases result: {}", e)))
    }
}

impl Default for RpcHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dispatcher for RpcHub {
    async fn run(
        &self,
        agent_key: &str,
        unit: &WorkUnit,
        previous: Option<&WorkUnit>,
    ) -> Result<(), RpcError> {
        let result = self
            .call(
                agent_key,
                RpcCall::Run {
                    work_unit: unit.clone(),
                    previous: previous.cloned(),
                },
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            // An agent that has not loaded its assignment yet cannot own
            // the unit; treat it like a connection that is not up yet so
            // the unit is retried instead of errored.
            Err(RpcError::Remote(msg)) if msg == ASSIGNMENT_NOT_READY => {
                Err(RpcError::NotConnected(agent_key.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn stop(&self, agent_key: &str, work_unit_id: Uuid) -> Result<(), RpcError> {
        self.call(agent_key, RpcCall::Stop { work_unit_id })
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_core::domain::run::WorkUnitSeed;

    fn fast_hub() -> RpcHub {
        RpcHub::with_timings(Duration::from_millis(200), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_call_without_connection_fails_immediately() {
        let hub = fast_hub();
        let unit = WorkUnitSeed::new("sales").into_work_unit(Uuid::new_v4(), Uuid::new_v4(), 0, 0);
        let started = std::time::Instant::now();
        let err = hub.run("vault-1", &unit, None).await.unwrap_err();
        assert!(matches!(err, RpcError::NotConnected(_)));
        // Synchronous failure, not a timeout.
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_call_round_trip_via_result_table() {
        let hub = std::sync::Arc::new(fast_hub());
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register("vault-1", "0.1.0", tx);

        // Fake agent: answer the first request with an ack.
        let responder = {
            let hub = hub.clone();
            tokio::spawn(async move {
                let envelope = rx.recv().await.expect("request should arrive");
                match envelope {
                    Envelope::Request { txn, call } => {
                        assert_eq!(call.method(), "Stop");
                        hub.complete_txn(txn, Some(serde_json::json!("ack")), None);
                    }
                    other => panic!("unexpected envelope: {:?}", other),
                }
            })
        };

        hub.stop("vault-1", Uuid::new_v4()).await.unwrap();
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_error_surfaces_as_typed_error() {
        let hub = std::sync::Arc::new(fast_hub());
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register("vault-1", "0.1.0", tx);

        let responder = {
            let hub = hub.clone();
            tokio::spawn(async move {
                if let Some(Envelope::Request { txn, .. }) = rx.recv().await {
                    hub.complete_txn(txn, None, Some("adapter exploded".to_string()));
                }
            })
        };

        let err = hub.stop("vault-1", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote(msg) if msg.contains("adapter exploded")));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_not_ready_agent_maps_to_not_connected() {
        let hub = std::sync::Arc::new(fast_hub());
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register("vault-1", "0.1.0", tx);

        // Fake agent that is connected but has no assignment yet.
        let responder = {
            let hub = hub.clone();
            tokio::spawn(async move {
                if let Some(Envelope::Request { txn, .. }) = rx.recv().await {
                    hub.complete_txn(txn, None, Some(ASSIGNMENT_NOT_READY.to_string()));
                }
            })
        };

        let unit = WorkUnitSeed::new("sales").into_work_unit(Uuid::new_v4(), Uuid::new_v4(), 0, 0);
        let err = hub.run("vault-1", &unit, None).await.unwrap_err();
        assert!(matches!(err, RpcError::NotConnected(_)));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_unanswered_call_times_out() {
        let hub = fast_hub();
        let (tx, _rx) = mpsc::unbounded_channel();
        hub.register("vault-1", "0.1.0", tx);

        let err = hub.stop("vault-1", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, RpcError::Timeout));
    }

    #[tokio::test]
    async fn test_stale_deregister_keeps_newer_connection() {
        let hub = fast_hub();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let old = hub.register("vault-1", "0.1.0", tx1);
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let _new = hub.register("vault-1", "0.1.1", tx2);

        hub.deregister("vault-1", old);
        assert!(hub.is_connected("vault-1"));
        assert_eq!(hub.connected_agents(), vec![("vault-1".to_string(), "0.1.1".to_string())]);
    }
}
