//! Coordinator configuration
//!
//! Bind addresses, the pipeline definition file, and the engine lock
//! timeout, loaded from environment variables with defaults.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the agent TCP server binds to.
    pub agent_bind_addr: String,

    /// Address the HTTP API binds to.
    pub api_bind_addr: String,

    /// JSON file with the pipeline definitions to load at startup.
    pub pipelines_path: Option<String>,

    /// Bounded wait for the engine's setup/execute mutexes.
    pub lock_timeout: Duration,
}

impl Config {
    /// Creates configuration from environment variables
    ///
    /// - AGENT_BIND_ADDR (default: 0.0.0.0:7070)
    /// - API_BIND_ADDR (default: 0.0.0.0:8080)
    /// - PIPELINES_PATH (optional)
    /// - LOCK_TIMEOUT_SECS (default: 30)
    pub fn from_env() -> Self {
        let agent_bind_addr =
            std::env::var("AGENT_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:7070".to_string());
        let api_bind_addr =
            std::env::var("API_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let pipelines_path = std::env::var("PIPELINES_PATH").ok();
        let lock_timeout = std::env::var("LOCK_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(30));

        Self {
            agent_bind_addr,
            api_bind_addr,
            pipelines_path,
            lock_timeout,
        }
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.agent_bind_addr.is_empty() {
            return Err("agent_bind_addr cannot be empty".to_string());
        }
        if self.api_bind_addr.is_empty() {
            return Err("api_bind_addr cannot be empty".to_string());
        }
        if self.agent_bind_addr == self.api_bind_addr {
            return Err("agent_bind_addr and api_bind_addr must differ".to_string());
        }
        if self.lock_timeout.as_secs() == 0 {
            return Err("lock_timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent_bind_addr: "0.0.0.0:7070".to_string(),
            api_bind_addr: "0.0.0.0:8080".to_string(),
            pipelines_path: None,
            lock_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lock_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_colliding_bind_addresses_are_rejected() {
        let mut config = Config::default();
        config.api_bind_addr = config.agent_bind_addr.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_lock_timeout_is_rejected() {
        let config = Config {
            lock_timeout: Duration::from_secs(0),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
