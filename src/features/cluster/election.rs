use super::message::{CoordinationMessage, MessagePayload, MessageType};
use super::node::NodeRole;
use super::{ClusterEvent, DistributedCoordinator, NodeId};
use crate::core::error::{Error, Result};
use rand::Rng;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A running election started by this node
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorElection {
    pub candidate_id: NodeId,
    pub term: u64,
    pub voters: HashSet<NodeId>,
    #[serde(skip)]
    pub started_at: Instant,
}

#[derive(Debug)]
pub(crate) struct ElectionState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub coordinator: Option<NodeId>,
    pub role: NodeRole,
    pub active: Option<CoordinatorElection>,
    /// Last vote cast or election started, used to hold off re-election
    pub last_activity: Option<Instant>,
}

impl Default for ElectionState {
    fn default() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            coordinator: None,
            role: NodeRole::Participant,
            active: None,
            last_activity: None,
        }
    }
}

impl ElectionState {
    /// Adopt a higher term. Returns true if a running election was cancelled.
    pub fn step_down(&mut self, term: u64) -> bool {
        self.current_term = term;
        self.voted_for = None;
        self.coordinator = None;
        self.role = NodeRole::Participant;
        self.active.take().is_some()
    }
}

impl DistributedCoordinator {
    /// Run one election for `current_term + 1`. Returns Ok(true) when this node
    /// became coordinator, Ok(false) when the election was superseded, and
    /// `ElectionTimeout` when no majority answered in time.
    pub async fn start_election(&self) -> Result<bool> {
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        let majority = self.majority();
        let peers: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|n| n.is_reachable())
            .map(|n| n.id.clone())
            .collect();

        let term = {
            let mut election = self.election.lock();
            if election.active.is_some() {
                return Ok(false);
            }
            election.current_term += 1;
            let term = election.current_term;
            election.voted_for = Some(self.config.node_id.clone());
            election.coordinator = None;
            election.role = NodeRole::Participant;
            election.last_activity = Some(Instant::now());
            election.active = Some(CoordinatorElection {
                candidate_id: self.config.node_id.clone(),
                term,
                voters: HashSet::from([self.config.node_id.clone()]),
                started_at: Instant::now(),
            });
            term
        };

        self.metrics.elections_started.fetch_add(1, Ordering::Relaxed);
        info!(node_id = %self.config.node_id, term, majority, "Starting election");

        if majority <= 1 {
            return Ok(self.become_coordinator(term));
        }

        let request = CoordinationMessage::new(
            MessageType::RequestVote,
            None,
            self.config.node_id.clone(),
        )
        .with_data(MessagePayload::Election { term });
        let sends = peers.iter().map(|peer| self.send_message(peer, request.clone()));
        futures::future::join_all(sends).await;

        match tokio::time::timeout(
            self.config.election_timeout,
            self.await_majority(term, majority),
        )
        .await
        {
            Ok(true) => Ok(self.become_coordinator(term)),
            Ok(false) => {
                debug!(term, "Election superseded");
                Ok(false)
            }
            Err(_) => {
                {
                    let mut election = self.election.lock();
                    if election.active.as_ref().map(|e| e.term) == Some(term) {
                        election.active = None;
                    }
                }
                warn!(node_id = %self.config.node_id, term, "Election timed out without a majority");
                let _ = self.event_bus.send(ClusterEvent::ElectionFailed { term });
                Err(Error::ElectionTimeout { term })
            }
        }
    }

    async fn await_majority(&self, term: u64, majority: usize) -> bool {
        loop {
            {
                let election = self.election.lock();
                match &election.active {
                    Some(active) if active.term == term => {
                        if active.voters.len() >= majority {
                            return true;
                        }
                    }
                    _ => return false,
                }
            }
            self.election_notify.notified().await;
        }
    }

    fn become_coordinator(&self, term: u64) -> bool {
        {
            let mut election = self.election.lock();
            let running = election.active.as_ref().map(|e| e.term) == Some(term);
            if election.current_term != term || !running {
                return false;
            }
            election.active = None;
            election.role = NodeRole::Coordinator;
            election.coordinator = Some(self.config.node_id.clone());
        }

        for mut node in self.nodes.iter_mut() {
            node.role = NodeRole::Participant;
        }
        self.metrics.elections_won.fetch_add(1, Ordering::Relaxed);
        info!(node_id = %self.config.node_id, term, "Became coordinator");
        let _ = self.event_bus.send(ClusterEvent::CoordinatorElected {
            node_id: self.config.node_id.clone(),
            term,
        });

        // Announce right away so peers adopt us before their own timers fire
        let weak = self.self_ref.clone();
        tokio::spawn(async move {
            if let Some(coordinator) = weak.upgrade() {
                coordinator.send_heartbeats().await;
            }
        });
        true
    }

    /// Start an election after a random delay unless a coordinator shows up first
    pub(crate) fn schedule_election(&self) {
        if self.election_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let max_jitter = self.config.election_jitter.as_millis() as u64;
        let jitter = Duration::from_millis(rand::rng().random_range(0..=max_jitter));
        let weak = self.self_ref.clone();

        tokio::spawn(async move {
            tokio::time::sleep(jitter).await;
            let Some(coordinator) = weak.upgrade() else {
                return;
            };
            coordinator.election_scheduled.store(false, Ordering::Release);
            if coordinator.is_shutting_down() || !coordinator.needs_election() {
                return;
            }
            if let Err(e) = coordinator.start_election().await {
                debug!(error = %e, "Scheduled election failed");
            }
        });
    }

    /// No coordinator known, no election running, and no recent voting activity
    pub(crate) fn needs_election(&self) -> bool {
        let election = self.election.lock();
        let quiet = election
            .last_activity
            .map_or(true, |at| at.elapsed() >= self.config.election_timeout);
        election.coordinator.is_none() && election.active.is_none() && quiet
    }

    pub(crate) async fn handle_request_vote(&self, message: CoordinationMessage) -> Result<()> {
        let Some(MessagePayload::Election { term }) = message.data else {
            debug!(from = %message.sender_id, "REQUEST_VOTE without term");
            return Ok(());
        };

        let (granted, current_term, cancelled) = {
            let mut election = self.election.lock();
            if term < election.current_term {
                (false, election.current_term, false)
            } else {
                let cancelled = if term > election.current_term {
                    election.step_down(term)
                } else {
                    false
                };
                let granted = match &election.voted_for {
                    None => true,
                    Some(candidate) => *candidate == message.sender_id,
                };
                if granted {
                    election.voted_for = Some(message.sender_id.clone());
                    election.last_activity = Some(Instant::now());
                }
                (granted, election.current_term, cancelled)
            }
        };
        if cancelled {
            self.election_notify.notify_one();
        }

        debug!(
            candidate = %message.sender_id,
            term,
            granted,
            "Vote requested"
        );
        let reply = CoordinationMessage::new(MessageType::Vote, None, self.config.node_id.clone())
            .with_data(MessagePayload::VoteReply {
                term: current_term,
                granted,
            });
        self.send_message(&message.sender_id, reply).await
    }

    pub(crate) fn handle_vote(&self, message: CoordinationMessage) {
        let Some(MessagePayload::VoteReply { term, granted }) = message.data else {
            return;
        };

        let wake = {
            let mut election = self.election.lock();
            if term > election.current_term {
                election.step_down(term)
            } else {
                match election.active.as_mut() {
                    Some(active) if active.term == term && granted => {
                        active.voters.insert(message.sender_id.clone())
                    }
                    _ => false,
                }
            }
        };
        if wake {
            self.election_notify.notify_one();
        }
    }
}
