//! RPC protocol types
//!
//! The coordinator and every agent speak newline-delimited JSON envelopes
//! over one persistent duplex TCP connection per agent. Both sides may issue
//! requests; responses are matched to requests by transaction id, out of
//! band from the push channel.
//!
//! This module contains:
//! - Envelope and call types: the logical RPC surface
//! - Framing: NDJSON read/write helpers
//! - Correlation: the shared transaction result table

pub mod correlation;
pub mod frame;

pub use correlation::CorrelationTable;
pub use frame::{read_frame, write_frame};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::{Agent, Pipeline, Stage, TaskKind, WorkUnit};

/// One wire frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    /// A call issued by either side, answered by a `Response` with the
    /// same transaction id.
    Request { txn: Uuid, call: RpcCall },
    /// Outcome of a previously issued request.
    Response {
        txn: Uuid,
        result: Option<Value>,
        error: Option<String>,
    },
}

/// The logical RPC surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum RpcCall {
    /// Agent announces identity and version after (re)connecting.
    Connect { agent_key: String, version: String },
    /// Agent asks for its assignment: the pipelines with stages it owns.
    FetchAssignment { agent_key: String },
    /// Coordinator dispatches one work unit, with the same-item upstream
    /// unit when the stage chains on an earlier one.
    Run {
        work_unit: WorkUnit,
        previous: Option<WorkUnit>,
    },
    /// Coordinator cancels an in-flight work unit.
    Stop { work_unit_id: Uuid },
    /// Probe the connectivity of kind-specific settings.
    TestConnection {
        kind: TaskKind,
        settings: HashMap<String, Value>,
    },
    /// List the databases reachable with kind-specific settings.
    ListDatabases {
        kind: TaskKind,
        settings: HashMap<String, Value>,
    },
    /// Batched progress telemetry, agent to coordinator.
    UpdateProgress { events: Vec<ProgressEvent> },
    /// Batched terminal completions, agent to coordinator.
    UpdateComplete { events: Vec<CompleteEvent> },
}

impl RpcCall {
    /// Method name for logging.
    pub fn method(&self) -> &'static str {
        match self {
            RpcCall::Connect { .. } => "Connect",
            RpcCall::FetchAssignment { .. } => "FetchAssignment",
            RpcCall::Run { .. } => "Run",
            RpcCall::Stop { .. } => "Stop",
            RpcCall::TestConnection { .. } => "TestConnection",
            RpcCall::ListDatabases { .. } => "ListDatabases",
            RpcCall::UpdateProgress { .. } => "UpdateProgress",
            RpcCall::UpdateComplete { .. } => "UpdateComplete",
        }
    }
}

/// Result of `FetchAssignment`: the agent row plus every active pipeline
/// containing at least one stage owned by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub agent: Agent,
    pub pipelines: Vec<Pipeline>,
}

impl Assignment {
    /// Resolves a stage definition across all assigned pipelines.
    pub fn stage(&self, stage_id: Uuid) -> Option<&Stage> {
        self.pipelines.iter().find_map(|p| p.stage(stage_id))
    }
}

/// Non-terminal progress report for a running work unit.
///
/// Events carry their own id so a flushed chunk can be removed from the
/// agent's authoritative buffer exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub id: Uuid,
    pub work_unit_id: Uuid,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(work_unit_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            work_unit_id,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// The single terminal report for a work unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteEvent {
    pub id: Uuid,
    pub work_unit_id: Uuid,
    pub message: String,
    pub artifact: Option<String>,
    pub is_error: bool,
    pub timestamp: DateTime<Utc>,
}

impl CompleteEvent {
    pub fn new(
        work_unit_id: Uuid,
        message: impl Into<String>,
        artifact: Option<String>,
        is_error: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            work_unit_id,
            message: message.into(),
            artifact,
            is_error,
            timestamp: Utc::now(),
        }
    }
}

/// Error string an agent answers `Run` with before its assignment has
/// loaded. The coordinator maps it to a connectivity failure so the unit
/// is retried once the agent is ready, instead of being errored.
pub const ASSIGNMENT_NOT_READY: &str = "assignment not loaded yet";

/// RPC failure taxonomy.
#[derive(Debug, Clone)]
pub enum RpcError {
    /// No live connection is registered for the agent key. Raised
    /// synchronously, before anything is sent.
    NotConnected(String),
    /// No response arrived within the round-trip deadline.
    Timeout,
    /// The remote side answered with an application error.
    Remote(String),
    /// The connection or encoding failed mid-flight.
    Transport(String),
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::NotConnected(key) => write!(f, "agent '{}' is not connected", key),
            RpcError::Timeout => write!(f, "rpc timed out waiting for response"),
            RpcError::Remote(msg) => write!(f, "remote error: {}", msg),
            RpcError::Transport(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

impl std::error::Error for RpcError {}
