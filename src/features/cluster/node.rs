use super::NodeId;
use crate::features::transactions::{TransactionId, TransactionState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Active,
    Failed,
    /// Missed heartbeats but still inside the failure timeout
    Suspected,
    /// Re-joined and still receiving decisions parked while it was away
    Recovering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Coordinator,
    Participant,
}

/// A peer in the membership registry
#[derive(Debug, Clone)]
pub struct DistributedNode {
    pub id: NodeId,
    pub endpoint: String,
    pub status: NodeStatus,
    pub last_heartbeat: Instant,
    pub role: NodeRole,
    pub transactions: HashSet<TransactionId>,
}

impl DistributedNode {
    pub fn new(id: impl Into<NodeId>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            status: NodeStatus::Active,
            last_heartbeat: Instant::now(),
            role: NodeRole::Participant,
            transactions: HashSet::new(),
        }
    }

    pub fn touch(&mut self) {
        self.last_heartbeat = Instant::now();
        if matches!(self.status, NodeStatus::Suspected | NodeStatus::Recovering) {
            self.status = NodeStatus::Active;
        }
    }

    /// Start tracking a shared transaction. The liveness clock restarts when the
    /// first one appears, since peers only exchange keepalives while they share one.
    pub fn track(&mut self, tx_id: &TransactionId) {
        if self.transactions.is_empty() {
            self.last_heartbeat = Instant::now();
        }
        self.transactions.insert(tx_id.clone());
    }

    pub fn is_reachable(&self) -> bool {
        matches!(self.status, NodeStatus::Active | NodeStatus::Suspected)
    }
}

/// 2PC phase of a distributed transaction. Moves forward only:
/// preparing -> committing|aborting -> completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributedPhase {
    Preparing,
    Committing,
    Aborting,
    Completed,
}

impl DistributedPhase {
    pub fn can_advance_to(self, next: DistributedPhase) -> bool {
        use DistributedPhase::*;
        matches!(
            (self, next),
            (Preparing, Committing)
                | (Preparing, Aborting)
                | (Committing, Completed)
                | (Aborting, Completed)
        )
    }
}

impl fmt::Display for DistributedPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DistributedPhase::Preparing => "preparing",
            DistributedPhase::Committing => "committing",
            DistributedPhase::Aborting => "aborting",
            DistributedPhase::Completed => "completed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vote {
    Commit,
    Abort,
}

/// Cluster-level view of a transaction spanning several nodes. The local branch
/// lives in the node's `TransactionManager` under the same id.
#[derive(Debug, Clone)]
pub struct DistributedTransaction {
    pub tx_id: TransactionId,
    pub coordinator_id: NodeId,
    pub participants: BTreeSet<NodeId>,
    /// Votes needed for a commit decision; participants lost during prepare still count
    pub required_votes: usize,
    pub votes: HashMap<NodeId, Vote>,
    pub phase: DistributedPhase,
    pub outcome: Option<TransactionState>,
    pub started_at: Instant,
    pub finished_at: Option<Instant>,
}

impl DistributedTransaction {
    pub fn new<I>(tx_id: TransactionId, coordinator_id: NodeId, participants: I) -> Self
    where
        I: IntoIterator<Item = NodeId>,
    {
        let participants: BTreeSet<NodeId> = participants.into_iter().collect();
        Self {
            tx_id,
            coordinator_id,
            required_votes: participants.len(),
            participants,
            votes: HashMap::new(),
            phase: DistributedPhase::Preparing,
            outcome: None,
            started_at: Instant::now(),
            finished_at: None,
        }
    }

    /// Move to `next`; returns false and leaves the phase unchanged on regression
    pub fn advance(&mut self, next: DistributedPhase) -> bool {
        if self.phase.can_advance_to(next) {
            self.phase = next;
            true
        } else {
            false
        }
    }

    /// Record a vote. The first vote from a participant wins; duplicates are ignored.
    pub fn record_vote(&mut self, node_id: &NodeId, vote: Vote) -> bool {
        if !self.participants.contains(node_id) || self.votes.contains_key(node_id) {
            return false;
        }
        self.votes.insert(node_id.clone(), vote);
        true
    }

    pub fn tally(&self) -> VoteTally {
        if let Some((node, _)) = self.votes.iter().find(|(_, v)| **v == Vote::Abort) {
            return VoteTally::Abort(format!("participant {} voted abort", node));
        }
        if self.participants.len() < self.required_votes {
            return VoteTally::Abort("participant failed during prepare".to_string());
        }
        let commits = self.votes.values().filter(|v| **v == Vote::Commit).count();
        if commits >= self.required_votes {
            VoteTally::Commit
        } else {
            VoteTally::Pending
        }
    }

    pub fn is_finished(&self) -> bool {
        self.phase == DistributedPhase::Completed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteTally {
    Pending,
    Commit,
    Abort(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dtx() -> DistributedTransaction {
        DistributedTransaction::new(
            TransactionId::from("tx"),
            "a".to_string(),
            ["b".to_string(), "c".to_string()],
        )
    }

    #[test]
    fn test_first_shared_transaction_restarts_liveness_clock() {
        let mut node = DistributedNode::new("b", "local://b");
        let stale = node.last_heartbeat;
        std::thread::sleep(std::time::Duration::from_millis(5));

        node.track(&TransactionId::from("t1"));
        assert!(node.last_heartbeat > stale);

        node.last_heartbeat = stale;
        node.track(&TransactionId::from("t2"));
        assert_eq!(node.last_heartbeat, stale);
        assert_eq!(node.transactions.len(), 2);
    }

    #[test]
    fn test_phase_only_moves_forward() {
        let mut tx = dtx();
        assert!(tx.advance(DistributedPhase::Committing));
        assert!(!tx.advance(DistributedPhase::Preparing));
        assert!(!tx.advance(DistributedPhase::Aborting));
        assert!(tx.advance(DistributedPhase::Completed));
        assert!(!tx.advance(DistributedPhase::Committing));
        assert_eq!(tx.phase, DistributedPhase::Completed);
    }

    #[test]
    fn test_tally() {
        let mut tx = dtx();
        assert_eq!(tx.tally(), VoteTally::Pending);
        assert!(tx.record_vote(&"b".to_string(), Vote::Commit));
        assert!(!tx.record_vote(&"b".to_string(), Vote::Abort));
        assert!(!tx.record_vote(&"z".to_string(), Vote::Commit));
        assert_eq!(tx.tally(), VoteTally::Pending);
        tx.record_vote(&"c".to_string(), Vote::Commit);
        assert_eq!(tx.tally(), VoteTally::Commit);
    }

    #[test]
    fn test_lost_participant_forces_abort() {
        let mut tx = dtx();
        tx.record_vote(&"b".to_string(), Vote::Commit);
        tx.participants.remove("c");
        assert!(matches!(tx.tally(), VoteTally::Abort(_)));
    }
}
