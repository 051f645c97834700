use super::message::{CoordinationMessage, MessagePayload, MessageType};
use super::node::{DistributedPhase, DistributedTransaction, Vote};
use super::transport::MessageHandler;
use super::{ClusterEvent, DistributedCoordinator};
use crate::core::error::{Error, Result};
use crate::features::transactions::TransactionState;
use async_trait::async_trait;
use std::sync::atomic::Ordering;
use tracing::{debug, info, trace, warn};

impl DistributedCoordinator {
    /// Inbound dispatch. Any message from a known peer counts as a sign of life.
    pub async fn handle_message(&self, message: CoordinationMessage) -> Result<()> {
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        self.metrics.messages_received.fetch_add(1, Ordering::Relaxed);
        if let Some(mut node) = self.nodes.get_mut(&message.sender_id) {
            node.touch();
        }
        trace!(
            from = %message.sender_id,
            message_type = %message.message_type,
            tx_id = ?message.transaction_id,
            "Message received"
        );

        match message.message_type {
            MessageType::Prepare => self.handle_prepare(message).await,
            MessageType::Commit => self.handle_commit(message).await,
            MessageType::Abort => self.handle_abort(message).await,
            MessageType::VoteCommit | MessageType::VoteAbort => {
                self.handle_vote_reply(message);
                Ok(())
            }
            MessageType::Heartbeat => self.handle_heartbeat(message).await,
            MessageType::Recovery => self.handle_recovery(message).await,
            MessageType::RequestVote => self.handle_request_vote(message).await,
            MessageType::Vote => {
                self.handle_vote(message);
                Ok(())
            }
        }
    }

    /// Participant side of phase one. Votes commit only if the local branch is
    /// still live; an abort vote also aborts the branch right away.
    async fn handle_prepare(&self, message: CoordinationMessage) -> Result<()> {
        let Some(tx_id) = message.transaction_id.clone() else {
            debug!(from = %message.sender_id, "PREPARE without transaction id");
            return Ok(());
        };
        let (coordinator_id, participants) = match message.data {
            Some(MessagePayload::Participants {
                coordinator_id,
                participants,
            }) => (coordinator_id, participants),
            _ => (message.sender_id.clone(), vec![self.config.node_id.clone()]),
        };

        let phase = self
            .transactions
            .entry(tx_id.clone())
            .or_insert_with(|| {
                DistributedTransaction::new(tx_id.clone(), coordinator_id.clone(), participants)
            })
            .phase;
        if let Some(mut node) = self.nodes.get_mut(&coordinator_id) {
            node.track(&tx_id);
        }

        let vote = match phase {
            DistributedPhase::Preparing => match self.tm.prepare_transaction(&tx_id).await {
                Ok(true) => Vote::Commit,
                Ok(false) => Vote::Abort,
                Err(e) => {
                    debug!(tx_id = %tx_id, error = %e, "Local branch cannot prepare");
                    Vote::Abort
                }
            },
            DistributedPhase::Committing => Vote::Commit,
            DistributedPhase::Aborting => Vote::Abort,
            DistributedPhase::Completed => {
                match self.tm.completed_state(&tx_id) {
                    Some(TransactionState::Committed) => Vote::Commit,
                    _ => Vote::Abort,
                }
            }
        };

        if vote == Vote::Abort && phase == DistributedPhase::Preparing {
            if let Some(mut dtx) = self.transactions.get_mut(&tx_id) {
                dtx.advance(DistributedPhase::Aborting);
            }
            if let Err(e) = self.abort_local(&tx_id, "voted abort on prepare").await {
                warn!(tx_id = %tx_id, error = %e, "Abort after abort vote failed");
            }
        }

        let reply_type = match vote {
            Vote::Commit => MessageType::VoteCommit,
            Vote::Abort => MessageType::VoteAbort,
        };
        debug!(tx_id = %tx_id, coordinator = %message.sender_id, %reply_type, "Voting");
        let reply =
            CoordinationMessage::for_transaction(reply_type, &tx_id, self.config.node_id.clone());
        self.send_with_retry(&message.sender_id, reply, false).await
    }

    async fn handle_commit(&self, message: CoordinationMessage) -> Result<()> {
        let Some(tx_id) = message.transaction_id.clone() else {
            return Ok(());
        };

        let phase = self.transactions.get_mut(&tx_id).map(|mut dtx| {
            dtx.advance(DistributedPhase::Committing);
            dtx.phase
        });
        match phase {
            Some(DistributedPhase::Aborting) => {
                warn!(tx_id = %tx_id, from = %message.sender_id, "COMMIT for a branch that already aborted");
                return Err(Error::InvalidStateTransition {
                    id: tx_id.to_string(),
                    from: DistributedPhase::Aborting.to_string(),
                    to: DistributedPhase::Committing.to_string(),
                });
            }
            Some(DistributedPhase::Completed) => {
                debug!(key = ?message.dedup_key(), "Duplicate decision ignored");
                return Ok(());
            }
            _ => {}
        }

        match self.tm.commit_local(&tx_id).await {
            Ok(()) | Err(Error::TransactionNotFound { .. }) => {}
            Err(e) => {
                warn!(tx_id = %tx_id, error = %e, "Local commit failed");
                return Err(e);
            }
        }

        if self.finish_distributed(&tx_id, TransactionState::Committed) {
            self.metrics.commits.fetch_add(1, Ordering::Relaxed);
            info!(tx_id = %tx_id, coordinator = %message.sender_id, "Committed on coordinator decision");
            let _ = self
                .event_bus
                .send(ClusterEvent::DistributedCommitted(tx_id.clone()));
        }
        Ok(())
    }

    async fn handle_abort(&self, message: CoordinationMessage) -> Result<()> {
        let Some(tx_id) = message.transaction_id.clone() else {
            return Ok(());
        };
        let reason = match &message.data {
            Some(MessagePayload::Reason { reason }) => reason.clone(),
            _ => "aborted by coordinator".to_string(),
        };

        let phase = self.transactions.get_mut(&tx_id).map(|mut dtx| {
            dtx.advance(DistributedPhase::Aborting);
            (dtx.phase, dtx.outcome)
        });
        match phase {
            Some((DistributedPhase::Committing, _))
            | Some((DistributedPhase::Completed, Some(TransactionState::Committed))) => {
                warn!(tx_id = %tx_id, from = %message.sender_id, "ABORT for a committed branch");
                return Err(Error::InvalidStateTransition {
                    id: tx_id.to_string(),
                    from: TransactionState::Committed.to_string(),
                    to: TransactionState::Aborted.to_string(),
                });
            }
            Some((DistributedPhase::Completed, _)) => {
                debug!(key = ?message.dedup_key(), "Duplicate decision ignored");
                return Ok(());
            }
            _ => {}
        }

        let local = self.abort_local(&tx_id, &reason).await;
        if self.finish_distributed(&tx_id, TransactionState::Aborted) {
            self.metrics.aborts.fetch_add(1, Ordering::Relaxed);
            info!(tx_id = %tx_id, reason = %reason, "Aborted on coordinator decision");
            let _ = self.event_bus.send(ClusterEvent::DistributedAborted {
                tx_id: tx_id.clone(),
                reason,
            });
        }
        local
    }

    /// Only counted while this node coordinates the transaction and is still
    /// collecting votes
    fn handle_vote_reply(&self, message: CoordinationMessage) {
        let Some(tx_id) = message.transaction_id.as_ref() else {
            return;
        };
        let vote = match message.message_type {
            MessageType::VoteCommit => Vote::Commit,
            _ => Vote::Abort,
        };

        let recorded = match self.transactions.get_mut(tx_id) {
            Some(mut dtx)
                if dtx.coordinator_id == self.config.node_id
                    && dtx.phase == DistributedPhase::Preparing =>
            {
                dtx.record_vote(&message.sender_id, vote)
            }
            _ => false,
        };
        debug!(tx_id = %tx_id, from = %message.sender_id, ?vote, recorded, "Vote received");

        if recorded {
            if let Some(waiter) = self.vote_waiters.get(tx_id) {
                waiter.notify_one();
            }
        }
    }
}

#[async_trait]
impl MessageHandler for DistributedCoordinator {
    async fn handle_message(&self, message: CoordinationMessage) -> Result<()> {
        DistributedCoordinator::handle_message(self, message).await
    }
}
