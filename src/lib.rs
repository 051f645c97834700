//! Transaction coordination engine: a lock manager with deadlock detection, a
//! transaction manager with isolation levels and savepoints, and a cluster
//! coordinator running two-phase commit, coordinator election and recovery.

pub mod config;
pub mod core;
pub mod features;

pub use crate::config::{EngineConfig, LoggingConfig};
pub use crate::core::error::{Error, Result};
pub use crate::features::cluster::{
    ClusterConfig, ClusterEvent, ClusterStatus, CoordinationMessage, DistributedCoordinator,
    DistributedPhase, DropRule, InProcessNetwork, MessageHandler, MessageType, NodeId,
    RecoveryInfo, RecoveryStrategy, Transport,
};
pub use crate::features::logging::init_logging;
pub use crate::features::transactions::{
    InMemoryStore, IsolationLevel, LockManager, LockType, ResourceStore, TransactionConfig,
    TransactionEvent, TransactionId, TransactionManager, TransactionOptions, TransactionState,
};
