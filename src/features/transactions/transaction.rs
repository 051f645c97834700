use super::isolation::{IsolationLevel, LockType};
use crate::features::cluster::NodeId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::time::{Duration, Instant, SystemTime};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransactionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TransactionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Active,
    Preparing,
    Prepared,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }

    /// Legal moves: active -> preparing -> prepared -> committed, and any
    /// non-terminal state -> aborted.
    pub fn can_transition_to(self, next: TransactionState) -> bool {
        use TransactionState::*;
        matches!(
            (self, next),
            (Active, Preparing)
                | (Preparing, Prepared)
                | (Prepared, Committed)
                | (Active, Aborted)
                | (Preparing, Aborted)
                | (Prepared, Aborted)
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Active => "active",
            TransactionState::Preparing => "preparing",
            TransactionState::Prepared => "prepared",
            TransactionState::Committed => "committed",
            TransactionState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Per-transaction options for `begin_transaction`
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    pub isolation_level: Option<IsolationLevel>,
    pub timeout: Option<Duration>,
    /// Remote nodes taking part; empty for a local transaction
    pub participants: Vec<NodeId>,
}

impl TransactionOptions {
    pub fn with_isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_participants(mut self, participants: Vec<NodeId>) -> Self {
        self.participants = participants;
        self
    }
}

/// Before/after image of a written resource. `original` is captured on the first
/// write and kept across later writes so the transaction can always roll back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteEntry {
    pub original: Option<Bytes>,
    pub new: Bytes,
}

#[derive(Debug, Clone)]
pub struct SavePoint {
    pub name: String,
    pub read_set: BTreeSet<String>,
    pub write_set: BTreeMap<String, WriteEntry>,
    pub locks: HashMap<String, LockType>,
    pub created_at: SystemTime,
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: TransactionId,
    pub state: TransactionState,
    pub isolation_level: IsolationLevel,
    pub read_set: BTreeSet<String>,
    /// Ordered by first write so rollback can replay in reverse
    pub write_set: BTreeMap<String, WriteEntry>,
    pub write_order: Vec<String>,
    pub locks: HashMap<String, LockType>,
    pub start_time: Instant,
    pub started_at: SystemTime,
    pub timeout: Duration,
    pub savepoints: Vec<SavePoint>,
    pub participants: Vec<NodeId>,
}

impl Transaction {
    pub fn new(
        id: TransactionId,
        isolation_level: IsolationLevel,
        timeout: Duration,
        participants: Vec<NodeId>,
    ) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            isolation_level,
            read_set: BTreeSet::new(),
            write_set: BTreeMap::new(),
            write_order: Vec::new(),
            locks: HashMap::new(),
            start_time: Instant::now(),
            started_at: SystemTime::now(),
            timeout,
            savepoints: Vec::new(),
            participants,
        }
    }

    pub fn is_distributed(&self) -> bool {
        !self.participants.is_empty()
    }

    /// Whether the held lock (if any) already covers a request of `lock_type`
    pub fn holds(&self, resource: &str, lock_type: LockType) -> bool {
        match self.locks.get(resource) {
            Some(LockType::Exclusive) => true,
            Some(LockType::Shared) => lock_type == LockType::Shared,
            None => false,
        }
    }

    pub fn record_lock(&mut self, resource: &str, lock_type: LockType) {
        let entry = self.locks.entry(resource.to_string()).or_insert(lock_type);
        if lock_type > *entry {
            *entry = lock_type;
        }
    }

    pub fn snapshot(&self, name: &str) -> SavePoint {
        SavePoint {
            name: name.to_string(),
            read_set: self.read_set.clone(),
            write_set: self.write_set.clone(),
            locks: self.locks.clone(),
            created_at: SystemTime::now(),
        }
    }

    pub fn summary(&self) -> TransactionSummary {
        TransactionSummary {
            id: self.id.clone(),
            state: self.state,
            isolation_level: self.isolation_level,
            reads: self.read_set.len(),
            writes: self.write_set.len(),
            locks: self.locks.len(),
            savepoints: self.savepoints.iter().map(|s| s.name.clone()).collect(),
            participants: self.participants.clone(),
            age_ms: self.start_time.elapsed().as_millis() as u64,
        }
    }
}

/// Read-only view of a live transaction
#[derive(Debug, Clone, Serialize)]
pub struct TransactionSummary {
    pub id: TransactionId,
    pub state: TransactionState,
    pub isolation_level: IsolationLevel,
    pub reads: usize,
    pub writes: usize,
    pub locks: usize,
    pub savepoints: Vec<String>,
    pub participants: Vec<NodeId>,
    pub age_ms: u64,
}
