use super::node::DistributedPhase;
use super::NodeId;
use crate::core::error::Result;
use crate::features::transactions::{TransactionId, TransactionState};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Prepare,
    Commit,
    Abort,
    VoteCommit,
    VoteAbort,
    Heartbeat,
    /// Recovery inquiry, and the state report answering it
    Recovery,
    RequestVote,
    Vote,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Prepare => "PREPARE",
            MessageType::Commit => "COMMIT",
            MessageType::Abort => "ABORT",
            MessageType::VoteCommit => "VOTE_COMMIT",
            MessageType::VoteAbort => "VOTE_ABORT",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::Recovery => "RECOVERY",
            MessageType::RequestVote => "REQUEST_VOTE",
            MessageType::Vote => "VOTE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessagePayload {
    /// Sent with PREPARE so participants learn the full participant set
    Participants {
        coordinator_id: NodeId,
        participants: Vec<NodeId>,
    },
    Inquiry,
    StateReport {
        state: Option<TransactionState>,
        phase: Option<DistributedPhase>,
    },
    Election {
        term: u64,
    },
    VoteReply {
        term: u64,
        granted: bool,
    },
    Heartbeat {
        term: u64,
        ack: bool,
    },
    /// Liveness only, exchanged by peers sharing an unfinished transaction. Carries
    /// no claim to coordinate the cluster.
    Keepalive,
    Reason {
        reason: String,
    },
}

/// Point-to-point message between cluster nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinationMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub transaction_id: Option<TransactionId>,
    pub sender_id: NodeId,
    /// Milliseconds since the unix epoch
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<MessagePayload>,
}

impl CoordinationMessage {
    pub fn new(
        message_type: MessageType,
        transaction_id: Option<TransactionId>,
        sender_id: impl Into<NodeId>,
    ) -> Self {
        Self {
            message_type,
            transaction_id,
            sender_id: sender_id.into(),
            timestamp: now_millis(),
            data: None,
        }
    }

    pub fn for_transaction(
        message_type: MessageType,
        tx_id: &TransactionId,
        sender_id: impl Into<NodeId>,
    ) -> Self {
        Self::new(message_type, Some(tx_id.clone()), sender_id)
    }

    pub fn with_data(mut self, data: MessagePayload) -> Self {
        self.data = Some(data);
        self
    }

    /// Key used to recognise duplicate deliveries
    pub fn dedup_key(&self) -> (Option<TransactionId>, MessageType) {
        (self.transaction_id.clone(), self.message_type)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
