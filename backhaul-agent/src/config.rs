//! Agent configuration
//!
//! The agent key and coordinator address are required; everything else has
//! defaults tuned for a small fleet.

use anyhow::{Context, Result};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Stable identity this agent announces on connect. Stages reference
    /// it to say where their work runs.
    pub agent_key: String,

    /// host:port of the coordinator's agent server.
    pub coordinator_addr: String,

    /// Deadline for a work unit whose stage sets no timeout.
    pub default_task_timeout: Duration,

    /// Fixed pause between reconnect attempts.
    pub reconnect_backoff: Duration,

    /// How often buffered telemetry is flushed.
    pub flush_interval: Duration,

    /// Maximum events per telemetry send.
    pub chunk_size: usize,

    /// Deadline for one telemetry chunk send.
    pub send_deadline: Duration,

    /// Round-trip deadline for requests the agent issues.
    pub rpc_timeout: Duration,
}

impl Config {
    /// Creates configuration from environment variables
    ///
    /// - AGENT_KEY (required)
    /// - COORDINATOR_ADDR (required)
    /// - TASK_TIMEOUT_SECS (default: 3600)
    /// - RECONNECT_BACKOFF_SECS (default: 5)
    /// - FLUSH_INTERVAL_MS (default: 1000)
    /// - CHUNK_SIZE (default: 100)
    /// - SEND_DEADLINE_MS (default: 500)
    /// - RPC_TIMEOUT_SECS (default: 30)
    pub fn from_env() -> Result<Self> {
        let agent_key =
            std::env::var("AGENT_KEY").context("AGENT_KEY environment variable is required")?;
        let coordinator_addr = std::env::var("COORDINATOR_ADDR")
            .context("COORDINATOR_ADDR environment variable is required")?;

        let default_task_timeout = env_u64("TASK_TIMEOUT_SECS", 3600).map(Duration::from_secs)?;
        let reconnect_backoff = env_u64("RECONNECT_BACKOFF_SECS", 5).map(Duration::from_secs)?;
        let flush_interval = env_u64("FLUSH_INTERVAL_MS", 1000).map(Duration::from_millis)?;
        let chunk_size = env_u64("CHUNK_SIZE", 100)? as usize;
        let send_deadline = env_u64("SEND_DEADLINE_MS", 500).map(Duration::from_millis)?;
        let rpc_timeout = env_u64("RPC_TIMEOUT_SECS", 30).map(Duration::from_secs)?;

        let config = Self {
            agent_key,
            coordinator_addr,
            default_task_timeout,
            reconnect_backoff,
            flush_interval,
            chunk_size,
            send_deadline,
            rpc_timeout,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.agent_key.is_empty(), "agent_key cannot be empty");
        anyhow::ensure!(
            !self.coordinator_addr.is_empty(),
            "coordinator_addr cannot be empty"
        );
        anyhow::ensure!(self.chunk_size > 0, "chunk_size must be greater than 0");
        anyhow::ensure!(
            !self.default_task_timeout.is_zero(),
            "default_task_timeout must be greater than 0"
        );
        anyhow::ensure!(
            !self.flush_interval.is_zero(),
            "flush_interval must be greater than 0"
        );
        Ok(())
    }
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("{} must be a positive integer, got '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            agent_key: "vault-1".to_string(),
            coordinator_addr: "127.0.0.1:7070".to_string(),
            default_task_timeout: Duration::from_secs(3600),
            reconnect_backoff: Duration::from_secs(5),
            flush_interval: Duration::from_millis(1000),
            chunk_size: 100,
            send_deadline: Duration::from_millis(500),
            rpc_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_base_config_is_valid() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_empty_agent_key_is_rejected() {
        let mut config = base_config();
        config.agent_key = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_chunk_size_is_rejected() {
        let mut config = base_config();
        config.chunk_size = 0;
        assert!(config.validate().is_err());
    }
}
