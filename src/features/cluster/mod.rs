//! Cluster coordination: membership, heartbeats and failure detection, term-based
//! coordinator election, two-phase commit and coordinator-failure recovery.
//!
//! `DistributedCoordinator` is split across files by concern; each file adds an
//! `impl DistributedCoordinator` block.

pub mod config;
pub mod election;
pub mod handlers;
pub mod heartbeat;
pub mod message;
pub mod node;
pub mod recovery;
pub mod transport;
pub mod two_phase;

pub use config::ClusterConfig;
pub use election::CoordinatorElection;
pub use message::{CoordinationMessage, MessagePayload, MessageType};
pub use node::{
    DistributedNode, DistributedPhase, DistributedTransaction, NodeRole, NodeStatus, Vote,
};
pub use recovery::{choose_strategy, RecoveryInfo, RecoveryStrategy};
pub use transport::{DropRule, InProcessNetwork, MessageHandler, Transport};

use crate::core::error::{Error, Result};
use crate::features::transactions::{
    CommitHook, TransactionId, TransactionManager, TransactionState,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use election::ElectionState;
use parking_lot::Mutex;
use recovery::Inquiry;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub type NodeId = String;

#[derive(Debug, Clone, Serialize)]
pub enum ClusterEvent {
    NodeJoined(NodeId),
    NodeFailed(NodeId),
    NodeRemoved(NodeId),
    CoordinatorElected { node_id: NodeId, term: u64 },
    ElectionFailed { term: u64 },
    Prepared(TransactionId),
    DistributedCommitted(TransactionId),
    DistributedAborted { tx_id: TransactionId, reason: String },
    RecoveryCompleted(RecoveryInfo),
}

#[derive(Debug, Default)]
struct ClusterMetrics {
    elections_started: AtomicU64,
    elections_won: AtomicU64,
    prepares: AtomicU64,
    commits: AtomicU64,
    aborts: AtomicU64,
    recoveries: AtomicU64,
    node_failures: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_dropped: AtomicU64,
    heartbeats_sent: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterMetricsSnapshot {
    pub elections_started: u64,
    pub elections_won: u64,
    pub prepares: u64,
    pub commits: u64,
    pub aborts: u64,
    pub recoveries: u64,
    pub node_failures: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub heartbeats_sent: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub id: NodeId,
    pub endpoint: String,
    pub status: NodeStatus,
    pub role: NodeRole,
    pub last_heartbeat_ms: u64,
    pub transactions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DistributedTransactionView {
    pub tx_id: TransactionId,
    pub coordinator_id: NodeId,
    pub participants: Vec<NodeId>,
    pub votes: usize,
    pub phase: DistributedPhase,
    pub outcome: Option<TransactionState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub node_id: NodeId,
    pub role: NodeRole,
    pub term: u64,
    pub coordinator: Option<NodeId>,
    pub cluster_size: usize,
    pub nodes: Vec<NodeView>,
    pub transactions: Vec<DistributedTransactionView>,
    pub pending_decisions: usize,
    pub metrics: ClusterMetricsSnapshot,
}

/// Per-node cluster coordinator and 2PC participant
pub struct DistributedCoordinator {
    config: ClusterConfig,
    tm: Arc<TransactionManager>,
    transport: Arc<dyn Transport>,
    nodes: DashMap<NodeId, DistributedNode>,
    transactions: DashMap<TransactionId, DistributedTransaction>,
    vote_waiters: DashMap<TransactionId, Arc<Notify>>,
    inquiries: DashMap<TransactionId, Inquiry>,
    /// COMMIT/ABORT messages that could not be delivered, resent on rejoin
    pending_decisions: DashMap<NodeId, Vec<CoordinationMessage>>,
    election: Mutex<ElectionState>,
    election_notify: Notify,
    election_scheduled: AtomicBool,
    event_bus: broadcast::Sender<ClusterEvent>,
    shutdown_tx: broadcast::Sender<()>,
    started: AtomicBool,
    shutdown: AtomicBool,
    metrics: ClusterMetrics,
    background: Mutex<Vec<JoinHandle<()>>>,
    self_ref: Weak<DistributedCoordinator>,
}

impl std::fmt::Debug for DistributedCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedCoordinator")
            .field("node_id", &self.config.node_id)
            .field("nodes", &self.nodes.len())
            .field("transactions", &self.transactions.len())
            .finish()
    }
}

impl DistributedCoordinator {
    pub fn new(
        config: ClusterConfig,
        tm: Arc<TransactionManager>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let (event_bus, _) = broadcast::channel(1024);
        let (shutdown_tx, _) = broadcast::channel(1);

        let coordinator = Arc::new_cyclic(|self_ref| Self {
            config,
            tm,
            transport,
            nodes: DashMap::new(),
            transactions: DashMap::new(),
            vote_waiters: DashMap::new(),
            inquiries: DashMap::new(),
            pending_decisions: DashMap::new(),
            election: Mutex::new(ElectionState::default()),
            election_notify: Notify::new(),
            election_scheduled: AtomicBool::new(false),
            event_bus,
            shutdown_tx,
            started: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            metrics: ClusterMetrics::default(),
            background: Mutex::new(Vec::new()),
            self_ref: self_ref.clone(),
        });

        let hook: Arc<dyn CommitHook> = coordinator.clone();
        coordinator.tm.set_commit_hook(Arc::downgrade(&hook));
        Ok(coordinator)
    }

    /// Start the heartbeat and failure-detection loops and schedule the initial
    /// election
    pub fn start(&self) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let heartbeat = self.spawn_heartbeat_loop();
        let detector = self.spawn_failure_detector();
        self.background.lock().extend([heartbeat, detector]);

        if self.coordinator_id().is_none() {
            self.schedule_election();
        }
        info!(node_id = %self.config.node_id, peers = self.nodes.len(), "Cluster coordinator started");
        Ok(())
    }

    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn transaction_manager(&self) -> &Arc<TransactionManager> {
        &self.tm
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.event_bus.subscribe()
    }

    pub fn current_term(&self) -> u64 {
        self.election.lock().current_term
    }

    pub fn coordinator_id(&self) -> Option<NodeId> {
        self.election.lock().coordinator.clone()
    }

    pub fn role(&self) -> NodeRole {
        self.election.lock().role
    }

    pub fn is_coordinator(&self) -> bool {
        self.role() == NodeRole::Coordinator
    }

    /// This node plus every registered peer
    pub fn cluster_size(&self) -> usize {
        self.nodes.len() + 1
    }

    pub(crate) fn majority(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    pub fn node(&self, node_id: &str) -> Option<DistributedNode> {
        self.nodes.get(node_id).map(|n| n.value().clone())
    }

    pub fn distributed_transaction(&self, tx_id: &TransactionId) -> Option<DistributedTransaction> {
        self.transactions.get(tx_id).map(|t| t.value().clone())
    }

    /// Register a peer. Decisions parked for it while it was away are resent.
    pub fn add_node(&self, node_id: impl Into<NodeId>, endpoint: impl Into<String>) -> Result<()> {
        let node_id = node_id.into();
        if node_id == self.config.node_id {
            return Err(Error::NodeExists(node_id));
        }

        let is_coordinator = self.coordinator_id().as_ref() == Some(&node_id);
        let has_parked = self.pending_decisions.contains_key(&node_id);
        match self.nodes.entry(node_id.clone()) {
            Entry::Occupied(_) => return Err(Error::NodeExists(node_id)),
            Entry::Vacant(vacant) => {
                let mut node = DistributedNode::new(node_id.clone(), endpoint);
                if is_coordinator {
                    node.role = NodeRole::Coordinator;
                }
                if has_parked {
                    node.status = NodeStatus::Recovering;
                }
                vacant.insert(node);
            }
        }

        info!(node_id = %node_id, "Node joined");
        let _ = self.event_bus.send(ClusterEvent::NodeJoined(node_id.clone()));
        self.redeliver_pending(&node_id);
        Ok(())
    }

    fn redeliver_pending(&self, node_id: &NodeId) {
        let Some((_, parked)) = self.pending_decisions.remove(node_id) else {
            return;
        };
        info!(node_id = %node_id, count = parked.len(), "Redelivering parked decisions");

        let weak = self.self_ref.clone();
        let node_id = node_id.clone();
        tokio::spawn(async move {
            let Some(coordinator) = weak.upgrade() else {
                return;
            };
            for message in parked {
                let _ = coordinator.send_with_retry(&node_id, message, true).await;
            }
            if let Some(mut node) = coordinator.nodes.get_mut(&node_id) {
                if node.status == NodeStatus::Recovering {
                    node.status = NodeStatus::Active;
                    debug!(node_id = %node_id, "Node caught up on parked decisions");
                }
            };
        });
    }

    /// Drop a peer from the registry. Transactions it was involved in go through
    /// coordinator-failure or participant-failure handling.
    pub async fn remove_node(&self, node_id: &str) -> Result<()> {
        let Some((node_id, _)) = self.nodes.remove(node_id) else {
            return Err(Error::NodeNotFound(node_id.to_string()));
        };

        let lost_coordinator = {
            let mut election = self.election.lock();
            if election.coordinator.as_ref() == Some(&node_id) {
                election.coordinator = None;
                true
            } else {
                false
            }
        };

        let affected: Vec<(TransactionId, bool)> = self
            .transactions
            .iter()
            .filter(|t| !t.is_finished())
            .filter_map(|t| {
                if t.coordinator_id == node_id {
                    Some((t.tx_id.clone(), true))
                } else if t.participants.contains(&node_id) {
                    Some((t.tx_id.clone(), false))
                } else {
                    None
                }
            })
            .collect();

        info!(
            node_id = %node_id,
            transactions = affected.len(),
            lost_coordinator,
            "Node removed"
        );
        let _ = self.event_bus.send(ClusterEvent::NodeRemoved(node_id.clone()));

        for (tx_id, coordinated) in affected {
            if coordinated {
                let weak = self.self_ref.clone();
                let failed = node_id.clone();
                tokio::spawn(async move {
                    if let Some(coordinator) = weak.upgrade() {
                        coordinator.handle_coordinator_failure(&tx_id, &failed).await;
                    }
                });
            } else {
                self.handle_participant_failure(&tx_id, &node_id);
            }
        }

        if lost_coordinator && !self.shutdown.load(Ordering::Acquire) {
            self.schedule_election();
        }
        Ok(())
    }

    pub(crate) async fn send_message(
        &self,
        target: &NodeId,
        message: CoordinationMessage,
    ) -> Result<()> {
        self.metrics.messages_sent.fetch_add(1, Ordering::Relaxed);
        let message_type = message.message_type;
        match self.transport.send(target, message).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.metrics.messages_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(to = %target, %message_type, error = %e, "Send failed");
                Err(e)
            }
        }
    }

    /// Send with linear backoff. With `park`, a message that still fails is kept
    /// for redelivery when the node re-joins.
    pub(crate) async fn send_with_retry(
        &self,
        target: &NodeId,
        message: CoordinationMessage,
        park: bool,
    ) -> Result<()> {
        let attempts = self.config.max_retry_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.send_message(target, message.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_backoff * attempt).await;
                    }
                }
            }
        }

        warn!(
            to = %target,
            message_type = %message.message_type,
            attempts,
            parked = park,
            "Giving up on message delivery"
        );
        if park {
            self.pending_decisions
                .entry(target.clone())
                .or_default()
                .push(message);
        }
        Err(last_error.unwrap_or_else(|| Error::NetworkMessageLoss {
            node_id: target.clone(),
            reason: "delivery failed".to_string(),
        }))
    }

    /// Drop completed distributed transactions and parked decisions older than the
    /// retention window, and forget transactions peers no longer share with this
    /// node. Returns the number of transactions and decisions dropped.
    pub fn purge_completed(&self) -> usize {
        let retention = self.config.decision_retention;
        let before = self.transactions.len();
        self.transactions.retain(|_, dtx| {
            dtx.finished_at
                .map_or(true, |finished| finished.elapsed() < retention)
        });
        let mut purged = before.saturating_sub(self.transactions.len());

        let cutoff = message::now_millis().saturating_sub(retention.as_millis() as u64);
        for mut parked in self.pending_decisions.iter_mut() {
            let kept = parked.len();
            parked.retain(|m| m.timestamp > cutoff);
            purged += kept - parked.len();
        }
        self.pending_decisions.retain(|_, parked| !parked.is_empty());

        let live: HashSet<TransactionId> = self
            .tm
            .active_transactions()
            .into_iter()
            .chain(
                self.transactions
                    .iter()
                    .filter(|t| !t.is_finished())
                    .map(|t| t.tx_id.clone()),
            )
            .collect();
        for mut node in self.nodes.iter_mut() {
            node.transactions.retain(|tx_id| live.contains(tx_id));
        }

        if purged > 0 {
            debug!(purged, "Purged completed distributed transactions");
        }
        purged
    }

    pub fn pending_decisions(&self, node_id: &str) -> usize {
        self.pending_decisions
            .get(node_id)
            .map(|p| p.len())
            .unwrap_or(0)
    }

    pub fn metrics(&self) -> ClusterMetricsSnapshot {
        let m = &self.metrics;
        ClusterMetricsSnapshot {
            elections_started: m.elections_started.load(Ordering::Relaxed),
            elections_won: m.elections_won.load(Ordering::Relaxed),
            prepares: m.prepares.load(Ordering::Relaxed),
            commits: m.commits.load(Ordering::Relaxed),
            aborts: m.aborts.load(Ordering::Relaxed),
            recoveries: m.recoveries.load(Ordering::Relaxed),
            node_failures: m.node_failures.load(Ordering::Relaxed),
            messages_sent: m.messages_sent.load(Ordering::Relaxed),
            messages_received: m.messages_received.load(Ordering::Relaxed),
            messages_dropped: m.messages_dropped.load(Ordering::Relaxed),
            heartbeats_sent: m.heartbeats_sent.load(Ordering::Relaxed),
        }
    }

    pub fn get_cluster_status(&self) -> ClusterStatus {
        let (role, term, coordinator) = {
            let election = self.election.lock();
            (
                election.role,
                election.current_term,
                election.coordinator.clone(),
            )
        };

        let mut nodes: Vec<NodeView> = self
            .nodes
            .iter()
            .map(|n| NodeView {
                id: n.id.clone(),
                endpoint: n.endpoint.clone(),
                status: n.status,
                role: n.role,
                last_heartbeat_ms: n.last_heartbeat.elapsed().as_millis() as u64,
                transactions: n.transactions.len(),
            })
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        let mut transactions: Vec<DistributedTransactionView> = self
            .transactions
            .iter()
            .map(|t| DistributedTransactionView {
                tx_id: t.tx_id.clone(),
                coordinator_id: t.coordinator_id.clone(),
                participants: t.participants.iter().cloned().collect(),
                votes: t.votes.len(),
                phase: t.phase,
                outcome: t.outcome,
            })
            .collect();
        transactions.sort_by(|a, b| a.tx_id.cmp(&b.tx_id));

        ClusterStatus {
            node_id: self.config.node_id.clone(),
            role,
            term,
            coordinator,
            cluster_size: self.cluster_size(),
            nodes,
            transactions,
            pending_decisions: self.pending_decisions.iter().map(|p| p.len()).sum(),
            metrics: self.metrics(),
        }
    }

    /// Stop background loops, abort transactions this node coordinates that have
    /// not reached a decision, then shut the transaction manager down
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(node_id = %self.config.node_id, "Shutting down cluster coordinator");
        let _ = self.shutdown_tx.send(());
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }

        let undecided: Vec<TransactionId> = self
            .transactions
            .iter()
            .filter(|t| {
                t.coordinator_id == self.config.node_id && t.phase == DistributedPhase::Preparing
            })
            .map(|t| t.tx_id.clone())
            .collect();
        for tx_id in undecided {
            if let Err(e) = self.abort_with_reason(&tx_id, "coordinator shutdown").await {
                warn!(tx_id = %tx_id, error = %e, "Abort during shutdown failed");
            }
        }

        self.tm.shutdown().await
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}
