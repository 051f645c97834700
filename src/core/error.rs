use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, Serialize)]
pub enum Error {
    #[error("Transaction {id} not found")]
    TransactionNotFound { id: String },

    #[error("Transaction {id} already exists")]
    TransactionExists { id: String },

    #[error("Transaction {id}: invalid state transition from {from} to {to}")]
    InvalidStateTransition { id: String, from: String, to: String },

    #[error("Lock timeout: tx={tx_id}, resource={resource}")]
    LockTimeout { tx_id: String, resource: String },

    #[error("Deadlock detected: tx {victim} aborted to break cycle {cycle:?}")]
    Deadlock { victim: String, cycle: Vec<String> },

    #[error("Prepare failed for transaction {id}: {reason}")]
    PrepareFailure { id: String, reason: String },

    #[error("Participant unavailable: {node_id}")]
    ParticipantUnavailable { node_id: String },

    #[error("Coordinator {node_id} failed: {reason}")]
    CoordinatorFailure { node_id: String, reason: String },

    #[error("Message to {node_id} lost: {reason}")]
    NetworkMessageLoss { node_id: String, reason: String },

    #[error("Transaction {id} timed out")]
    TransactionTimeout { id: String },

    #[error("Transaction {id} aborted: {reason}")]
    TransactionAborted { id: String, reason: String },

    #[error("Node {node_id} is not the coordinator for transaction {tx_id}")]
    NotCoordinator { node_id: String, tx_id: String },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Node already registered: {0}")]
    NodeExists(String),

    #[error("Savepoint {name} not found in transaction {tx_id}")]
    SavepointNotFound { tx_id: String, name: String },

    #[error("Maximum transaction limit reached: {limit}")]
    TransactionLimitReached { limit: usize },

    #[error("Election timeout for term {term}")]
    ElectionTimeout { term: u64 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(format!("JSON error: {}", err))
    }
}

impl Error {
    pub fn error_code(&self) -> i32 {
        match self {
            Error::TransactionNotFound { .. } => -1,
            Error::TransactionExists { .. } => -2,
            Error::InvalidStateTransition { .. } => -3,
            Error::LockTimeout { .. } => -4,
            Error::Deadlock { .. } => -5,
            Error::PrepareFailure { .. } => -6,
            Error::ParticipantUnavailable { .. } => -7,
            Error::CoordinatorFailure { .. } => -8,
            Error::NetworkMessageLoss { .. } => -9,
            Error::TransactionTimeout { .. } => -10,
            Error::TransactionAborted { .. } => -11,
            Error::NotCoordinator { .. } => -12,
            Error::NodeNotFound(_) => -13,
            Error::NodeExists(_) => -14,
            Error::SavepointNotFound { .. } => -15,
            Error::TransactionLimitReached { .. } => -16,
            Error::ElectionTimeout { .. } => -17,
            Error::Storage(_) => -18,
            Error::Config(_) => -19,
            Error::Serialization(_) => -20,
            Error::Io(_) => -21,
            Error::ShuttingDown => -22,
            Error::Internal(_) => -99,
        }
    }

    /// Errors the caller may retry with a fresh transaction or message.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LockTimeout { .. }
                | Error::Deadlock { .. }
                | Error::NetworkMessageLoss { .. }
                | Error::ParticipantUnavailable { .. }
                | Error::ElectionTimeout { .. }
        )
    }

    /// Errors after which the caller's transaction is known to be aborted.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            Error::Deadlock { .. }
                | Error::PrepareFailure { .. }
                | Error::TransactionTimeout { .. }
                | Error::TransactionAborted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            Error::TransactionNotFound { id: "t".to_string() }.error_code(),
            -1
        );
        assert_eq!(Error::Internal("x".to_string()).error_code(), -99);
    }

    #[test]
    fn test_classification() {
        let deadlock = Error::Deadlock {
            victim: "t2".to_string(),
            cycle: vec!["t1".to_string(), "t2".to_string()],
        };
        assert!(deadlock.is_retryable());
        assert!(deadlock.is_abort());

        let timeout = Error::LockTimeout {
            tx_id: "t1".to_string(),
            resource: "a".to_string(),
        };
        assert!(timeout.is_retryable());
        assert!(!timeout.is_abort());

        assert!(!Error::Config("bad".to_string()).is_retryable());
    }

    #[test]
    fn test_io_conversion() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert!(matches!(err, Error::Io(_)));
    }
}
