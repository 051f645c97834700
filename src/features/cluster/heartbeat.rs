use super::message::{CoordinationMessage, MessagePayload, MessageType};
use super::node::{NodeRole, NodeStatus};
use super::{ClusterEvent, DistributedCoordinator, NodeId};
use crate::core::error::Result;
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

impl DistributedCoordinator {
    pub(crate) fn spawn_heartbeat_loop(&self) -> JoinHandle<()> {
        let weak = self.self_ref.clone();
        let interval = self.config.heartbeat_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(coordinator) = weak.upgrade() else {
                            break;
                        };
                        if coordinator.is_coordinator() {
                            coordinator.send_heartbeats().await;
                        } else {
                            coordinator.send_keepalives().await;
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    pub(crate) fn spawn_failure_detector(&self) -> JoinHandle<()> {
        let weak = self.self_ref.clone();
        let interval = self.config.heartbeat_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(coordinator) = weak.upgrade() else {
                            break;
                        };
                        coordinator.check_failures().await;
                        coordinator.purge_completed();
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    /// Send HEARTBEAT carrying our term to every reachable peer. Returns the number
    /// of peers the heartbeat was handed to.
    pub async fn send_heartbeats(&self) -> usize {
        let term = self.current_term();
        let peers: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|n| n.is_reachable())
            .map(|n| n.id.clone())
            .collect();

        let heartbeat =
            CoordinationMessage::new(MessageType::Heartbeat, None, self.config.node_id.clone())
                .with_data(MessagePayload::Heartbeat { term, ack: false });
        let sends = peers
            .iter()
            .map(|peer| self.send_message(peer, heartbeat.clone()));
        let sent = futures::future::join_all(sends)
            .await
            .into_iter()
            .filter(|r| r.is_ok())
            .count();

        self.metrics
            .heartbeats_sent
            .fetch_add(sent as u64, Ordering::Relaxed);
        sent
    }

    /// Keepalive to every peer this node shares an unfinished transaction with.
    /// Lets a transaction coordinator that is not the cluster coordinator and its
    /// participants detect each other's failure.
    pub async fn send_keepalives(&self) -> usize {
        let peers = self.transaction_peers();
        if peers.is_empty() {
            return 0;
        }
        let keepalive =
            CoordinationMessage::new(MessageType::Heartbeat, None, self.config.node_id.clone())
                .with_data(MessagePayload::Keepalive);
        let sends = peers
            .iter()
            .map(|peer| self.send_message(peer, keepalive.clone()));
        let sent = futures::future::join_all(sends)
            .await
            .into_iter()
            .filter(|r| r.is_ok())
            .count();

        self.metrics
            .heartbeats_sent
            .fetch_add(sent as u64, Ordering::Relaxed);
        sent
    }

    /// Reachable peers involved in a transaction with this node
    pub(crate) fn transaction_peers(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.is_reachable() && !n.transactions.is_empty())
            .map(|n| n.id.clone())
            .collect()
    }

    /// Failure sweep. The coordinator watches every peer; other nodes watch the
    /// coordinator and every peer they share an unfinished transaction with. Nodes
    /// silent for half the failure timeout become suspected, silent for the full
    /// timeout they are marked failed and removed.
    pub async fn check_failures(&self) -> Vec<NodeId> {
        let (is_coordinator, coordinator) = {
            let election = self.election.lock();
            (
                election.role == NodeRole::Coordinator,
                election.coordinator.clone(),
            )
        };

        let watched: BTreeSet<NodeId> = if is_coordinator {
            self.nodes.iter().map(|n| n.id.clone()).collect()
        } else {
            coordinator
                .into_iter()
                .filter(|c| *c != self.config.node_id)
                .chain(self.transaction_peers())
                .collect()
        };

        let failure_timeout = self.config.failure_timeout;
        let mut failed = Vec::new();
        for node_id in watched {
            let Some(mut node) = self.nodes.get_mut(&node_id) else {
                continue;
            };
            let silent = node.last_heartbeat.elapsed();
            if silent >= failure_timeout {
                node.status = NodeStatus::Failed;
                failed.push(node_id.clone());
            } else if silent >= failure_timeout / 2 && node.status == NodeStatus::Active {
                node.status = NodeStatus::Suspected;
                debug!(node_id = %node_id, silent_ms = silent.as_millis() as u64, "Node suspected");
            }
        }

        for node_id in &failed {
            warn!(node_id = %node_id, "Node failed: no heartbeat within failure timeout");
            self.metrics.node_failures.fetch_add(1, Ordering::Relaxed);
            let _ = self.event_bus.send(ClusterEvent::NodeFailed(node_id.clone()));
            if let Err(e) = self.remove_node(node_id).await {
                debug!(node_id = %node_id, error = %e, "Failed node already removed");
            }
        }

        if !is_coordinator && !self.nodes.is_empty() && self.needs_election() {
            self.schedule_election();
        }
        failed
    }

    /// A heartbeat with a term at least ours makes the sender our coordinator and
    /// cancels any election we are running. Acks and keepalives only refresh
    /// liveness, which the dispatcher already did.
    pub(crate) async fn handle_heartbeat(&self, message: CoordinationMessage) -> Result<()> {
        let Some(MessagePayload::Heartbeat { term, ack }) = message.data else {
            return Ok(());
        };
        if ack {
            return Ok(());
        }

        let (adopted, changed, cancelled) = {
            let mut election = self.election.lock();
            if term < election.current_term {
                (false, false, false)
            } else {
                if term > election.current_term {
                    election.current_term = term;
                    election.voted_for = None;
                }
                let changed = election.coordinator.as_ref() != Some(&message.sender_id);
                election.coordinator = Some(message.sender_id.clone());
                election.role = NodeRole::Participant;
                let cancelled = election.active.take().is_some();
                (true, changed, cancelled)
            }
        };

        if !adopted {
            debug!(from = %message.sender_id, term, "Ignoring stale heartbeat");
            return Ok(());
        }
        if cancelled {
            self.election_notify.notify_one();
        }
        if changed {
            for mut node in self.nodes.iter_mut() {
                node.role = if node.id == message.sender_id {
                    NodeRole::Coordinator
                } else {
                    NodeRole::Participant
                };
            }
            info!(coordinator = %message.sender_id, term, "Following coordinator");
        }

        let ack = CoordinationMessage::new(MessageType::Heartbeat, None, self.config.node_id.clone())
            .with_data(MessagePayload::Heartbeat { term, ack: true });
        self.send_message(&message.sender_id, ack).await
    }
}
