use super::message::{CoordinationMessage, MessagePayload, MessageType};
use super::node::{DistributedPhase, DistributedTransaction, Vote, VoteTally};
use super::{ClusterEvent, DistributedCoordinator, NodeId};
use crate::core::error::{Error, Result};
use crate::features::logging::OperationTimer;
use crate::features::transactions::{
    CommitHook, TransactionId, TransactionOptions, TransactionState,
};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Result of trying to move a distributed transaction into the aborting phase
enum AbortStart {
    Started,
    AlreadyAborted,
    Unknown,
}

impl DistributedCoordinator {
    /// Begin a transaction spanning this node and `participants`. This node is its
    /// coordinator; the local branch is opened in the transaction manager.
    pub async fn begin_distributed_transaction(
        &self,
        tx_id: Option<TransactionId>,
        participants: Vec<NodeId>,
    ) -> Result<TransactionId> {
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }

        let participants: BTreeSet<NodeId> = participants
            .into_iter()
            .filter(|p| *p != self.config.node_id)
            .collect();
        if participants.is_empty() {
            return Err(Error::ParticipantUnavailable {
                node_id: "<none>".to_string(),
            });
        }
        for participant in &participants {
            match self.nodes.get(participant) {
                None => return Err(Error::NodeNotFound(participant.clone())),
                Some(node) if !node.is_reachable() => {
                    return Err(Error::ParticipantUnavailable {
                        node_id: participant.clone(),
                    })
                }
                Some(_) => {}
            }
        }

        let options =
            TransactionOptions::default().with_participants(participants.iter().cloned().collect());
        let tx_id = self.tm.begin_transaction(tx_id, options).await?;

        self.transactions.insert(
            tx_id.clone(),
            DistributedTransaction::new(
                tx_id.clone(),
                self.config.node_id.clone(),
                participants.iter().cloned(),
            ),
        );
        for participant in &participants {
            if let Some(mut node) = self.nodes.get_mut(participant) {
                node.track(&tx_id);
            }
        }

        info!(
            tx_id = %tx_id,
            participants = participants.len(),
            "Distributed transaction started"
        );
        Ok(tx_id)
    }

    /// Open this node's branch of a transaction coordinated by `coordinator_id`.
    /// The branch votes on PREPARE under the same id.
    pub async fn join_transaction(
        &self,
        tx_id: TransactionId,
        coordinator_id: &NodeId,
    ) -> Result<TransactionId> {
        if !self.nodes.contains_key(coordinator_id) {
            return Err(Error::NodeNotFound(coordinator_id.clone()));
        }
        let tx_id = self
            .tm
            .begin_transaction(Some(tx_id), TransactionOptions::default())
            .await?;
        if let Some(mut node) = self.nodes.get_mut(coordinator_id) {
            node.track(&tx_id);
        }
        debug!(tx_id = %tx_id, coordinator = %coordinator_id, "Joined distributed transaction");
        Ok(tx_id)
    }

    /// Two-phase commit. Only the transaction's coordinator may drive it. Any
    /// failure before the commit decision aborts the whole transaction and is
    /// returned as `PrepareFailure`.
    pub async fn commit_distributed_transaction(&self, tx_id: &TransactionId) -> Result<()> {
        let (coordinator_id, phase, outcome) = {
            let dtx = self
                .transactions
                .get(tx_id)
                .ok_or_else(|| Error::TransactionNotFound {
                    id: tx_id.to_string(),
                })?;
            (dtx.coordinator_id.clone(), dtx.phase, dtx.outcome)
        };

        if coordinator_id != self.config.node_id {
            return Err(Error::NotCoordinator {
                node_id: self.config.node_id.clone(),
                tx_id: tx_id.to_string(),
            });
        }
        match phase {
            DistributedPhase::Preparing => {}
            DistributedPhase::Completed if outcome == Some(TransactionState::Committed) => {
                return Ok(())
            }
            DistributedPhase::Completed | DistributedPhase::Aborting => {
                return Err(Error::TransactionAborted {
                    id: tx_id.to_string(),
                    reason: "distributed transaction already aborted".to_string(),
                })
            }
            DistributedPhase::Committing => {
                return Err(Error::InvalidStateTransition {
                    id: tx_id.to_string(),
                    from: phase.to_string(),
                    to: DistributedPhase::Preparing.to_string(),
                })
            }
        }

        let notify = Arc::new(Notify::new());
        match self.vote_waiters.entry(tx_id.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::InvalidStateTransition {
                    id: tx_id.to_string(),
                    from: DistributedPhase::Preparing.to_string(),
                    to: DistributedPhase::Preparing.to_string(),
                })
            }
            Entry::Vacant(vacant) => {
                vacant.insert(notify.clone());
            }
        }

        let timer = OperationTimer::new("two_phase_commit", tx_id.as_str());
        let result = self.run_two_phase(tx_id, notify).await;
        self.vote_waiters.remove(tx_id);
        timer.complete(&result);
        result
    }

    async fn run_two_phase(&self, tx_id: &TransactionId, notify: Arc<Notify>) -> Result<()> {
        self.metrics.prepares.fetch_add(1, Ordering::Relaxed);

        let local_vote = match self.tm.prepare_transaction(tx_id).await {
            Ok(vote) => vote,
            Err(e) => {
                debug!(tx_id = %tx_id, error = %e, "Coordinator branch failed to prepare");
                false
            }
        };
        if !local_vote {
            return self
                .fail_prepare(tx_id, "coordinator branch cannot prepare".to_string())
                .await;
        }

        let participants = self.participants_of(tx_id);
        let prepare = CoordinationMessage::for_transaction(
            MessageType::Prepare,
            tx_id,
            self.config.node_id.clone(),
        )
        .with_data(MessagePayload::Participants {
            coordinator_id: self.config.node_id.clone(),
            participants: participants.clone(),
        });

        let sends = participants.iter().map(|p| {
            let prepare = prepare.clone();
            async move { (p, self.send_with_retry(p, prepare, false).await) }
        });
        for (participant, result) in futures::future::join_all(sends).await {
            if let Err(e) = result {
                warn!(tx_id = %tx_id, participant = %participant, error = %e, "PREPARE not delivered");
                if let Some(mut dtx) = self.transactions.get_mut(tx_id) {
                    dtx.record_vote(participant, Vote::Abort);
                }
            }
        }

        let tally = match tokio::time::timeout(
            self.config.prepare_timeout,
            self.collect_votes(tx_id, &notify),
        )
        .await
        {
            Ok(tally) => tally,
            Err(_) => VoteTally::Abort(format!(
                "prepare timed out after {}ms",
                self.config.prepare_timeout.as_millis()
            )),
        };
        if let VoteTally::Abort(reason) = tally {
            return self.fail_prepare(tx_id, reason).await;
        }

        let decided = self
            .transactions
            .get_mut(tx_id)
            .map(|mut dtx| dtx.advance(DistributedPhase::Committing))
            .unwrap_or(false);
        if !decided {
            return Err(Error::TransactionAborted {
                id: tx_id.to_string(),
                reason: "aborted during prepare".to_string(),
            });
        }
        info!(tx_id = %tx_id, participants = participants.len(), "All participants voted commit");
        let _ = self.event_bus.send(ClusterEvent::Prepared(tx_id.clone()));

        // Past the decision point: failures from here on are retried, never aborted
        self.deliver_decision(tx_id, MessageType::Commit, None).await;
        let local = self.tm.commit_local(tx_id).await;
        if let Err(e) = &local {
            warn!(tx_id = %tx_id, error = %e, "Local commit after decision failed");
        }

        if self.finish_distributed(tx_id, TransactionState::Committed) {
            self.metrics.commits.fetch_add(1, Ordering::Relaxed);
            let _ = self
                .event_bus
                .send(ClusterEvent::DistributedCommitted(tx_id.clone()));
        }
        info!(tx_id = %tx_id, "Distributed transaction committed");
        local
    }

    async fn fail_prepare(&self, tx_id: &TransactionId, reason: String) -> Result<()> {
        warn!(tx_id = %tx_id, reason = %reason, "Prepare failed, aborting");
        if let Err(e) = self.abort_with_reason(tx_id, &reason).await {
            warn!(tx_id = %tx_id, error = %e, "Abort after failed prepare did not complete");
        }
        Err(Error::PrepareFailure {
            id: tx_id.to_string(),
            reason,
        })
    }

    /// Resolves as soon as every participant voted commit, any voted abort, or a
    /// participant was lost
    async fn collect_votes(&self, tx_id: &TransactionId, notify: &Notify) -> VoteTally {
        loop {
            let tally = match self.transactions.get(tx_id) {
                Some(dtx) if dtx.phase == DistributedPhase::Preparing => dtx.tally(),
                Some(_) => VoteTally::Abort("transaction left the prepare phase".to_string()),
                None => VoteTally::Abort("transaction no longer tracked".to_string()),
            };
            if tally != VoteTally::Pending {
                return tally;
            }
            notify.notified().await;
        }
    }

    /// Send ABORT to every participant and abort the local branch
    pub async fn abort_distributed_transaction(&self, tx_id: &TransactionId) -> Result<()> {
        let coordinator_id = self
            .transactions
            .get(tx_id)
            .map(|dtx| dtx.coordinator_id.clone())
            .ok_or_else(|| Error::TransactionNotFound {
                id: tx_id.to_string(),
            })?;
        if coordinator_id != self.config.node_id {
            return Err(Error::NotCoordinator {
                node_id: self.config.node_id.clone(),
                tx_id: tx_id.to_string(),
            });
        }
        self.abort_with_reason(tx_id, "aborted by coordinator").await
    }

    pub(crate) async fn abort_with_reason(&self, tx_id: &TransactionId, reason: &str) -> Result<()> {
        match self.start_abort(tx_id)? {
            AbortStart::AlreadyAborted => return Ok(()),
            AbortStart::Unknown => return self.abort_local(tx_id, reason).await,
            AbortStart::Started => {}
        }
        if let Some(waiter) = self.vote_waiters.get(tx_id) {
            waiter.notify_one();
        }

        self.deliver_decision(
            tx_id,
            MessageType::Abort,
            Some(MessagePayload::Reason {
                reason: reason.to_string(),
            }),
        )
        .await;
        let local = self.abort_local(tx_id, reason).await;

        if self.finish_distributed(tx_id, TransactionState::Aborted) {
            self.metrics.aborts.fetch_add(1, Ordering::Relaxed);
            let _ = self.event_bus.send(ClusterEvent::DistributedAborted {
                tx_id: tx_id.clone(),
                reason: reason.to_string(),
            });
        }
        info!(tx_id = %tx_id, reason, "Distributed transaction aborted");
        local
    }

    fn start_abort(&self, tx_id: &TransactionId) -> Result<AbortStart> {
        let Some(mut dtx) = self.transactions.get_mut(tx_id) else {
            return Ok(AbortStart::Unknown);
        };
        match dtx.phase {
            DistributedPhase::Preparing => {
                dtx.advance(DistributedPhase::Aborting);
                Ok(AbortStart::Started)
            }
            DistributedPhase::Aborting => Ok(AbortStart::Started),
            DistributedPhase::Completed if dtx.outcome == Some(TransactionState::Aborted) => {
                Ok(AbortStart::AlreadyAborted)
            }
            phase => Err(Error::InvalidStateTransition {
                id: tx_id.to_string(),
                from: phase.to_string(),
                to: DistributedPhase::Aborting.to_string(),
            }),
        }
    }

    pub(crate) async fn abort_local(&self, tx_id: &TransactionId, reason: &str) -> Result<()> {
        match self.tm.abort_transaction(tx_id, reason).await {
            Ok(()) | Err(Error::TransactionNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Deliver COMMIT or ABORT to every participant other than this node. Failed
    /// deliveries are parked for redelivery on rejoin.
    pub(crate) async fn deliver_decision(
        &self,
        tx_id: &TransactionId,
        message_type: MessageType,
        data: Option<MessagePayload>,
    ) {
        let mut decision =
            CoordinationMessage::for_transaction(message_type, tx_id, self.config.node_id.clone());
        decision.data = data;

        let targets: Vec<NodeId> = self
            .participants_of(tx_id)
            .into_iter()
            .filter(|p| *p != self.config.node_id)
            .collect();
        let sends = targets
            .iter()
            .map(|target| self.send_with_retry(target, decision.clone(), true));
        let failed = futures::future::join_all(sends)
            .await
            .into_iter()
            .filter(|r| r.is_err())
            .count();
        if failed > 0 {
            warn!(
                tx_id = %tx_id,
                %message_type,
                failed,
                "Decision parked for unreachable participants"
            );
        }
    }

    /// Mark completed with `outcome`. Returns false if it already was.
    pub(crate) fn finish_distributed(&self, tx_id: &TransactionId, outcome: TransactionState) -> bool {
        let participants = {
            let Some(mut dtx) = self.transactions.get_mut(tx_id) else {
                return false;
            };
            if dtx.is_finished() {
                return false;
            }
            match (dtx.phase, outcome) {
                (DistributedPhase::Preparing, TransactionState::Committed) => {
                    dtx.advance(DistributedPhase::Committing);
                }
                (DistributedPhase::Preparing, _) => {
                    dtx.advance(DistributedPhase::Aborting);
                }
                _ => {}
            }
            dtx.advance(DistributedPhase::Completed);
            dtx.outcome = Some(outcome);
            dtx.finished_at = Some(Instant::now());
            let mut involved: Vec<NodeId> = dtx.participants.iter().cloned().collect();
            involved.push(dtx.coordinator_id.clone());
            involved
        };

        for node_id in participants {
            if let Some(mut node) = self.nodes.get_mut(&node_id) {
                node.transactions.remove(tx_id);
            }
        }
        true
    }

    /// Participant lost while a transaction is in flight. During prepare the
    /// node leaves the participant set, which leaves too few commit votes and so
    /// aborts. After the decision the node simply receives it on rejoin.
    pub(crate) fn handle_participant_failure(&self, tx_id: &TransactionId, node_id: &NodeId) {
        let removed = match self.transactions.get_mut(tx_id) {
            Some(mut dtx) if dtx.phase == DistributedPhase::Preparing => {
                dtx.participants.remove(node_id)
            }
            _ => false,
        };
        if removed {
            warn!(tx_id = %tx_id, node_id = %node_id, "Participant lost during prepare");
            if let Some(waiter) = self.vote_waiters.get(tx_id) {
                waiter.notify_one();
            }
        }
    }

    pub(crate) fn participants_of(&self, tx_id: &TransactionId) -> Vec<NodeId> {
        self.transactions
            .get(tx_id)
            .map(|dtx| dtx.participants.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CommitHook for DistributedCoordinator {
    async fn commit_distributed(&self, tx_id: &TransactionId) -> Result<()> {
        self.commit_distributed_transaction(tx_id).await
    }
}
