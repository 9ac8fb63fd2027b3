//! Agent domain model
//!
//! Represents a remote process that owns and executes pipeline stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An agent that executes stages assigned to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Stable identity announced on connect; stages reference this key.
    pub key: String,

    pub name: String,

    /// Version announced by the agent on its last connect.
    pub version: Option<String>,

    /// When this agent was first seen.
    pub registered_at: DateTime<Utc>,

    /// Last time this agent (re)connected.
    pub last_connected_at: DateTime<Utc>,

    pub status: AgentStatus,
}

impl Agent {
    pub fn new(key: impl Into<String>, version: Option<String>) -> Self {
        let key = key.into();
        let now = Utc::now();
        Self {
            name: key.clone(),
            key,
            version,
            registered_at: now,
            last_connected_at: now,
            status: AgentStatus::Online,
        }
    }
}

/// Connection status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    /// Agent holds a live connection to the coordinator.
    Online,

    /// Agent connection dropped and has not come back yet.
    Offline,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Online => write!(f, "Online"),
            AgentStatus::Offline => write!(f, "Offline"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_agent_is_online() {
        let agent = Agent::new("vault-1", Some("0.1.0".to_string()));
        assert_eq!(agent.key, "vault-1");
        assert_eq!(agent.status, AgentStatus::Online);
        assert_eq!(agent.version.as_deref(), Some("0.1.0"));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(AgentStatus::Online.to_string(), "Online");
        assert_eq!(AgentStatus::Offline.to_string(), "Offline");
    }
}
