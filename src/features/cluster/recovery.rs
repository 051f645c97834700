use super::message::{CoordinationMessage, MessagePayload, MessageType};
use super::node::DistributedPhase;
use super::{ClusterEvent, DistributedCoordinator, NodeId};
use crate::core::error::{Error, Result};
use crate::features::transactions::{TransactionId, TransactionState};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Commit,
    Abort,
    /// Ask the surviving participants; any committed report forces commit
    Inquiry,
}

/// Outcome of recovering one transaction after its coordinator failed
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryInfo {
    pub tx_id: TransactionId,
    pub last_phase: DistributedPhase,
    pub participant_states: BTreeMap<NodeId, Option<TransactionState>>,
    pub strategy: RecoveryStrategy,
    pub outcome: TransactionState,
}

/// An in-flight state inquiry, filled in by RECOVERY replies
#[derive(Debug)]
pub(crate) struct Inquiry {
    reports: BTreeMap<NodeId, Option<TransactionState>>,
    expected: usize,
    notify: Arc<Notify>,
}

impl Inquiry {
    fn settled(&self) -> bool {
        self.reports.len() >= self.expected
            || self
                .reports
                .values()
                .any(|s| *s == Some(TransactionState::Committed))
    }
}

/// Pick a strategy from the last phase this node saw and its own branch state.
/// A prepared branch in the prepare phase may be in doubt: the old coordinator
/// could have decided commit and told someone else, so it needs an inquiry.
pub fn choose_strategy(
    phase: DistributedPhase,
    local: Option<TransactionState>,
) -> RecoveryStrategy {
    match (phase, local) {
        (DistributedPhase::Committing, _) => RecoveryStrategy::Commit,
        (DistributedPhase::Aborting, _) => RecoveryStrategy::Abort,
        (
            DistributedPhase::Preparing,
            Some(TransactionState::Prepared) | Some(TransactionState::Committed),
        ) => RecoveryStrategy::Inquiry,
        (DistributedPhase::Preparing, _) => RecoveryStrategy::Abort,
        (DistributedPhase::Completed, Some(TransactionState::Committed)) => {
            RecoveryStrategy::Commit
        }
        (DistributedPhase::Completed, Some(TransactionState::Aborted)) => RecoveryStrategy::Abort,
        (DistributedPhase::Completed, _) => RecoveryStrategy::Inquiry,
    }
}

impl DistributedCoordinator {
    /// The surviving participant with the lowest id takes the transaction over.
    /// The others wait one recovery timeout per rank and step in only if the
    /// transaction is still undecided by then.
    pub(crate) async fn handle_coordinator_failure(&self, tx_id: &TransactionId, failed: &NodeId) {
        let Some(rank) = self.recovery_rank(tx_id) else {
            return;
        };

        if rank > 0 {
            debug!(tx_id = %tx_id, failed = %failed, rank, "Coordinator failed, waiting for recovery driver");
            tokio::time::sleep(self.config.recovery_timeout * rank as u32).await;
            let pending = self
                .transactions
                .get(tx_id)
                .map_or(false, |dtx| !dtx.is_finished());
            if !pending || self.is_shutting_down() {
                return;
            }
            warn!(tx_id = %tx_id, "Recovery driver silent, taking over");
        } else {
            warn!(tx_id = %tx_id, failed = %failed, "Coordinator failed, taking over recovery");
        }

        if let Some(mut dtx) = self.transactions.get_mut(tx_id) {
            dtx.coordinator_id = self.config.node_id.clone();
        }
        if let Err(e) = self.recover_transaction(tx_id).await {
            let failure = Error::CoordinatorFailure {
                node_id: failed.clone(),
                reason: e.to_string(),
            };
            warn!(tx_id = %tx_id, error = %failure, "Recovery did not complete");
        }
    }

    /// Position of this node among the surviving participants, lowest id first
    fn recovery_rank(&self, tx_id: &TransactionId) -> Option<usize> {
        let dtx = self.transactions.get(tx_id)?;
        if dtx.is_finished() {
            return None;
        }
        dtx.participants
            .iter()
            .filter(|p| **p == self.config.node_id || self.nodes.contains_key(*p))
            .position(|p| *p == self.config.node_id)
    }

    /// Drive a transaction whose coordinator is gone to a terminal outcome and
    /// tell every surviving participant
    pub async fn recover_transaction(&self, tx_id: &TransactionId) -> Result<RecoveryInfo> {
        let last_phase = self
            .transactions
            .get(tx_id)
            .map(|dtx| dtx.phase)
            .ok_or_else(|| Error::TransactionNotFound {
                id: tx_id.to_string(),
            })?;
        let local = self.tm.transaction_state(tx_id).await;
        let strategy = choose_strategy(last_phase, local);
        info!(tx_id = %tx_id, phase = %last_phase, ?strategy, "Recovering transaction");

        let mut participant_states = BTreeMap::new();
        participant_states.insert(self.config.node_id.clone(), local);

        let commit = match strategy {
            RecoveryStrategy::Commit => true,
            RecoveryStrategy::Abort => false,
            RecoveryStrategy::Inquiry => {
                let targets: Vec<NodeId> = self
                    .participants_of(tx_id)
                    .into_iter()
                    .filter(|p| *p != self.config.node_id)
                    .collect();
                participant_states.extend(self.run_inquiry(tx_id, &targets).await);
                participant_states
                    .values()
                    .any(|s| *s == Some(TransactionState::Committed))
            }
        };

        let outcome = if commit {
            self.recover_commit(tx_id).await?;
            TransactionState::Committed
        } else {
            self.abort_with_reason(tx_id, "coordinator failed before commit decision")
                .await?;
            TransactionState::Aborted
        };

        let info = RecoveryInfo {
            tx_id: tx_id.clone(),
            last_phase,
            participant_states,
            strategy,
            outcome,
        };
        self.metrics.recoveries.fetch_add(1, Ordering::Relaxed);
        info!(tx_id = %tx_id, ?strategy, outcome = %outcome, "Recovery completed");
        let _ = self
            .event_bus
            .send(ClusterEvent::RecoveryCompleted(info.clone()));
        Ok(info)
    }

    async fn recover_commit(&self, tx_id: &TransactionId) -> Result<()> {
        if let Some(mut dtx) = self.transactions.get_mut(tx_id) {
            dtx.advance(DistributedPhase::Committing);
        }
        self.deliver_decision(tx_id, MessageType::Commit, None).await;

        let local = match self.tm.commit_local(tx_id).await {
            Ok(()) | Err(Error::TransactionNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        };
        if self.finish_distributed(tx_id, TransactionState::Committed) {
            self.metrics.commits.fetch_add(1, Ordering::Relaxed);
            let _ = self
                .event_bus
                .send(ClusterEvent::DistributedCommitted(tx_id.clone()));
        }
        local
    }

    /// Ask `targets` for their branch state. Returns once all answered, one
    /// reported committed, or the recovery timeout passed; silent nodes map to None.
    async fn run_inquiry(
        &self,
        tx_id: &TransactionId,
        targets: &[NodeId],
    ) -> BTreeMap<NodeId, Option<TransactionState>> {
        let notify = Arc::new(Notify::new());
        self.inquiries.insert(
            tx_id.clone(),
            Inquiry {
                reports: BTreeMap::new(),
                expected: targets.len(),
                notify: notify.clone(),
            },
        );

        let inquiry = CoordinationMessage::for_transaction(
            MessageType::Recovery,
            tx_id,
            self.config.node_id.clone(),
        )
        .with_data(MessagePayload::Inquiry);
        let sends = targets.iter().map(|target| {
            let inquiry = inquiry.clone();
            async move { (target, self.send_with_retry(target, inquiry, false).await) }
        });
        for (target, result) in futures::future::join_all(sends).await {
            if result.is_err() {
                if let Some(mut pending) = self.inquiries.get_mut(tx_id) {
                    pending.reports.entry(target.clone()).or_insert(None);
                }
            }
        }

        let wait = async {
            loop {
                let settled = self
                    .inquiries
                    .get(tx_id)
                    .map_or(true, |pending| pending.settled());
                if settled {
                    break;
                }
                notify.notified().await;
            }
        };
        if tokio::time::timeout(self.config.recovery_timeout, wait)
            .await
            .is_err()
        {
            warn!(tx_id = %tx_id, "Recovery inquiry timed out");
        }

        let mut reports = self
            .inquiries
            .remove(tx_id)
            .map(|(_, pending)| pending.reports)
            .unwrap_or_default();
        for target in targets {
            reports.entry(target.clone()).or_insert(None);
        }
        reports
    }

    /// RECOVERY: an inquiry is answered with this node's branch state; a state
    /// report feeds the inquiry this node is running
    pub(crate) async fn handle_recovery(&self, message: CoordinationMessage) -> Result<()> {
        let Some(tx_id) = message.transaction_id.clone() else {
            return Ok(());
        };

        match message.data {
            Some(MessagePayload::Inquiry) => {
                let state = self.tm.transaction_state(&tx_id).await;
                let phase = self.transactions.get(&tx_id).map(|dtx| dtx.phase);
                debug!(tx_id = %tx_id, to = %message.sender_id, ?state, "Answering recovery inquiry");
                let report = CoordinationMessage::for_transaction(
                    MessageType::Recovery,
                    &tx_id,
                    self.config.node_id.clone(),
                )
                .with_data(MessagePayload::StateReport { state, phase });
                self.send_message(&message.sender_id, report).await
            }
            Some(MessagePayload::StateReport { state, .. }) => {
                let notify = self.inquiries.get_mut(&tx_id).map(|mut pending| {
                    pending.reports.insert(message.sender_id.clone(), state);
                    pending.notify.clone()
                });
                match notify {
                    Some(notify) => notify.notify_one(),
                    None => debug!(tx_id = %tx_id, from = %message.sender_id, "Late recovery report"),
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
