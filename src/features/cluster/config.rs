use super::NodeId;
use crate::config::duration_ms;
use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Cluster coordination settings for one node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub node_id: NodeId,
    pub endpoint: String,
    /// Coordinator heartbeat period, also the failure sweep period
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Silence after which a node is declared failed
    #[serde(with = "duration_ms")]
    pub failure_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub election_timeout: Duration,
    /// Upper bound of the random delay before a node starts an election
    #[serde(with = "duration_ms")]
    pub election_jitter: Duration,
    #[serde(with = "duration_ms")]
    pub prepare_timeout: Duration,
    /// How long an inquiry waits for participant state reports
    #[serde(with = "duration_ms")]
    pub recovery_timeout: Duration,
    pub max_retry_attempts: u32,
    #[serde(with = "duration_ms")]
    pub retry_backoff: Duration,
    /// How long completed distributed transactions and undeliverable parked
    /// decisions are kept
    #[serde(with = "duration_ms")]
    pub decision_retention: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            endpoint: "local://node-1".to_string(),
            heartbeat_interval: Duration::from_secs(1),
            failure_timeout: Duration::from_secs(5),
            election_timeout: Duration::from_secs(3),
            election_jitter: Duration::from_millis(500),
            prepare_timeout: Duration::from_secs(30),
            recovery_timeout: Duration::from_secs(5),
            max_retry_attempts: 3,
            retry_backoff: Duration::from_millis(100),
            decision_retention: Duration::from_secs(300),
        }
    }
}

impl ClusterConfig {
    pub fn new(node_id: impl Into<NodeId>, endpoint: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(Error::Config("node_id must not be empty".to_string()));
        }
        let timeouts = [
            ("heartbeat_interval", self.heartbeat_interval),
            ("failure_timeout", self.failure_timeout),
            ("election_timeout", self.election_timeout),
            ("prepare_timeout", self.prepare_timeout),
            ("recovery_timeout", self.recovery_timeout),
            ("decision_retention", self.decision_retention),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }
        if self.heartbeat_interval >= self.failure_timeout {
            return Err(Error::Config(
                "heartbeat_interval must be shorter than failure_timeout".to_string(),
            ));
        }
        if self.max_retry_attempts == 0 {
            return Err(Error::Config(
                "max_retry_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ClusterConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.failure_timeout, Duration::from_secs(5));
        assert_eq!(config.election_timeout, Duration::from_secs(3));
        assert_eq!(config.prepare_timeout, Duration::from_secs(30));
        config.validate().unwrap();
    }

    #[test]
    fn test_validation_rejects_bad_timing() {
        let mut config = ClusterConfig::new("n1", "local://n1");
        config.heartbeat_interval = Duration::from_secs(10);
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = ClusterConfig::new("", "local://");
        config.heartbeat_interval = Duration::from_millis(10);
        assert!(config.validate().is_err());
    }
}
