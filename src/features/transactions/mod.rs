pub mod isolation;
pub mod manager;
pub mod storage;
pub mod transaction;

pub use isolation::{DeadlockInfo, IsolationLevel, LockManager, LockType};
pub use manager::{
    CommitHook, TransactionConfig, TransactionEvent, TransactionManager,
    TransactionMetricsSnapshot,
};
pub use storage::{InMemoryStore, ResourceStore};
pub use transaction::{
    SavePoint, Transaction, TransactionId, TransactionOptions, TransactionState,
    TransactionSummary, WriteEntry,
};
