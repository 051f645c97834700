use crate::core::error::{Error, Result};
use crate::features::cluster::ClusterConfig;
use crate::features::transactions::TransactionConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Logging settings consumed by `init_logging`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl LoggingConfig {
    pub fn tracing_level(&self) -> Result<tracing::Level> {
        self.level
            .parse()
            .map_err(|_| Error::Config(format!("invalid log level: {}", self.level)))
    }
}

/// Complete node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub transactions: TransactionConfig,
    pub cluster: ClusterConfig,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        let tx = &self.transactions;
        if tx.lock_timeout.is_zero() {
            return Err(Error::Config("lock_timeout must be greater than zero".to_string()));
        }
        if tx.transaction_timeout.is_zero() {
            return Err(Error::Config(
                "transaction_timeout must be greater than zero".to_string(),
            ));
        }
        if tx.deadlock_check_interval.is_zero() {
            return Err(Error::Config(
                "deadlock_check_interval must be greater than zero".to_string(),
            ));
        }
        if tx.max_concurrent_transactions == 0 {
            return Err(Error::Config(
                "max_concurrent_transactions must be at least 1".to_string(),
            ));
        }
        self.logging.tracing_level()?;
        self.cluster.validate()
    }
}

/// Serde helper storing a `Duration` as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::transactions::IsolationLevel;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{
                "transactions": { "lock_timeout": 250, "default_isolation": "SERIALIZABLE" },
                "cluster": { "node_id": "node-a", "heartbeat_interval": 100, "failure_timeout": 500 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.transactions.lock_timeout, Duration::from_millis(250));
        assert_eq!(
            config.transactions.default_isolation,
            IsolationLevel::Serializable
        );
        assert_eq!(
            config.transactions.transaction_timeout,
            Duration::from_secs(30)
        );
        assert_eq!(config.cluster.node_id, "node-a");
        assert_eq!(config.cluster.election_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_rejects_invalid() {
        let err = EngineConfig::from_json_str(r#"{ "transactions": { "lock_timeout": 0 } }"#)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = EngineConfig::from_json_str(r#"{ "logging": { "level": "loud" } }"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = EngineConfig::from_json_str("not json").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_file_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let config = EngineConfig::default();
        file.write_all(config.to_json().unwrap().as_bytes()).unwrap();

        let loaded = EngineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(loaded.cluster.prepare_timeout, config.cluster.prepare_timeout);
        assert_eq!(loaded.logging.level, "info");
    }
}
