use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// SQL standard transaction isolation levels
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    /// Reads take no lock and may observe uncommitted writes
    ReadUncommitted,
    /// Reads take a shared lock for the duration of the read only
    #[default]
    ReadCommitted,
    /// Read locks are held until commit or abort
    RepeatableRead,
    /// Read locks are held until commit or abort
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadUncommitted => write!(f, "READ_UNCOMMITTED"),
            IsolationLevel::ReadCommitted => write!(f, "READ_COMMITTED"),
            IsolationLevel::RepeatableRead => write!(f, "REPEATABLE_READ"),
            IsolationLevel::Serializable => write!(f, "SERIALIZABLE"),
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = crate::core::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace([' ', '-'], "_").as_str() {
            "READ_UNCOMMITTED" => Ok(IsolationLevel::ReadUncommitted),
            "READ_COMMITTED" => Ok(IsolationLevel::ReadCommitted),
            "REPEATABLE_READ" => Ok(IsolationLevel::RepeatableRead),
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            other => Err(crate::core::error::Error::Config(format!(
                "unknown isolation level: {}",
                other
            ))),
        }
    }
}

impl IsolationLevel {
    /// Check if this isolation level prevents dirty reads
    pub fn prevents_dirty_reads(self) -> bool {
        !matches!(self, IsolationLevel::ReadUncommitted)
    }

    /// Check if this isolation level prevents non-repeatable reads
    pub fn prevents_non_repeatable_reads(self) -> bool {
        matches!(
            self,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable
        )
    }

    /// Get the lock duration policy for reads under this isolation level
    pub fn lock_duration_policy(self) -> LockDurationPolicy {
        match self {
            IsolationLevel::ReadUncommitted => LockDurationPolicy::None,
            IsolationLevel::ReadCommitted => LockDurationPolicy::ReadUnlockImmediately,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => {
                LockDurationPolicy::HoldUntilCommit
            }
        }
    }
}

/// How long a read lock lives. Write locks are always held until commit/abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockDurationPolicy {
    /// No read locks taken
    None,
    /// Unlock read locks immediately after read
    ReadUnlockImmediately,
    /// Hold all locks until transaction commit/abort
    HoldUntilCommit,
}
