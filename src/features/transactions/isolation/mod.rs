//! Lock-based isolation for local transactions
//!
//! - **Isolation levels**: which reads take locks and how long they are held
//! - **Lock manager**: shared/exclusive resource locks with FIFO wait queues
//! - **Deadlock detector**: wait-for graph, DFS cycle search, youngest-victim choice

pub mod deadlock;
pub mod levels;
pub mod locks;

pub use deadlock::{DeadlockDetector, DeadlockInfo, WaitForGraph};
pub use levels::{IsolationLevel, LockDurationPolicy};
pub use locks::{
    DeadlockResolver, LockAcquisition, LockManager, LockManagerStats, LockSnapshot, LockType,
    LockWaiter,
};
