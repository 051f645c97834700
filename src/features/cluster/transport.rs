use super::message::{CoordinationMessage, MessageType};
use super::NodeId;
use crate::core::error::{Error, Result};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Outbound delivery. Implementations return once the message is handed off or
/// fail with `NetworkMessageLoss`/`ParticipantUnavailable`; they need not be reliable.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, target: &NodeId, message: CoordinationMessage) -> Result<()>;
}

/// Inbound side of a node
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, message: CoordinationMessage) -> Result<()>;
}

/// Messages matching every set field are silently dropped
#[derive(Debug, Clone, Default)]
pub struct DropRule {
    pub from: Option<NodeId>,
    pub to: Option<NodeId>,
    pub message_type: Option<MessageType>,
}

impl DropRule {
    pub fn to(node: impl Into<NodeId>) -> Self {
        Self {
            to: Some(node.into()),
            ..Default::default()
        }
    }

    pub fn from(node: impl Into<NodeId>) -> Self {
        Self {
            from: Some(node.into()),
            ..Default::default()
        }
    }

    pub fn of_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    fn matches(&self, target: &NodeId, message: &CoordinationMessage) -> bool {
        self.from.as_ref().map_or(true, |f| *f == message.sender_id)
            && self.to.as_ref().map_or(true, |t| t == target)
            && self.message_type.map_or(true, |t| t == message.message_type)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkStats {
    pub delivered: u64,
    pub dropped: u64,
    pub rejected: u64,
}

/// Transport routing messages between coordinators in one process. Each delivery
/// runs on its own task, so handlers may send replies without re-entering the caller.
pub struct InProcessNetwork {
    nodes: DashMap<NodeId, Weak<dyn MessageHandler>>,
    disconnected: DashSet<NodeId>,
    drop_rules: RwLock<Vec<DropRule>>,
    latency: RwLock<Duration>,
    delivered: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
}

impl Default for InProcessNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessNetwork {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            disconnected: DashSet::new(),
            drop_rules: RwLock::new(Vec::new()),
            latency: RwLock::new(Duration::ZERO),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn register(&self, node_id: impl Into<NodeId>, handler: Weak<dyn MessageHandler>) {
        self.nodes.insert(node_id.into(), handler);
    }

    pub fn unregister(&self, node_id: &str) {
        self.nodes.remove(node_id);
    }

    /// Cut a node off in both directions; sends to or from it fail
    pub fn disconnect(&self, node_id: &str) {
        self.disconnected.insert(node_id.to_string());
    }

    pub fn reconnect(&self, node_id: &str) {
        self.disconnected.remove(node_id);
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        !self.disconnected.contains(node_id)
    }

    pub fn add_drop_rule(&self, rule: DropRule) {
        self.drop_rules.write().push(rule);
    }

    pub fn clear_drop_rules(&self) {
        self.drop_rules.write().clear();
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl Transport for InProcessNetwork {
    async fn send(&self, target: &NodeId, message: CoordinationMessage) -> Result<()> {
        if self.disconnected.contains(target) || self.disconnected.contains(&message.sender_id) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(Error::NetworkMessageLoss {
                node_id: target.clone(),
                reason: "node disconnected".to_string(),
            });
        }

        let handler = self.nodes.get(target).and_then(|h| h.value().upgrade());
        let Some(handler) = handler else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(Error::ParticipantUnavailable {
                node_id: target.clone(),
            });
        };

        if self
            .drop_rules
            .read()
            .iter()
            .any(|rule| rule.matches(target, &message))
        {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(
                from = %message.sender_id,
                to = %target,
                message_type = %message.message_type,
                "Dropping message"
            );
            return Ok(());
        }

        let latency = *self.latency.read();
        let target = target.clone();
        self.delivered.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            trace!(to = %target, message_type = %message.message_type, "Delivering message");
            let message_type = message.message_type;
            if let Err(e) = handler.handle_message(message).await {
                warn!(to = %target, %message_type, error = %e, "Message handler failed");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct Recorder {
        tx: mpsc::UnboundedSender<CoordinationMessage>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle_message(&self, message: CoordinationMessage) -> Result<()> {
            let _ = self.tx.send(message);
            Ok(())
        }
    }

    fn network_with_recorder() -> (
        InProcessNetwork,
        Arc<Recorder>,
        mpsc::UnboundedReceiver<CoordinationMessage>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder { tx });
        let network = InProcessNetwork::new();
        let handler: Arc<dyn MessageHandler> = recorder.clone();
        network.register("b", Arc::downgrade(&handler));
        (network, recorder, rx)
    }

    #[tokio::test]
    async fn test_delivery_and_disconnect() {
        let (network, _recorder, mut rx) = network_with_recorder();
        let msg = CoordinationMessage::new(MessageType::Heartbeat, None, "a");

        network.send(&"b".to_string(), msg.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().sender_id, "a");

        network.disconnect("a");
        let err = network.send(&"b".to_string(), msg.clone()).await.unwrap_err();
        assert!(matches!(err, Error::NetworkMessageLoss { .. }));

        network.reconnect("a");
        network.send(&"b".to_string(), msg).await.unwrap();
        assert!(rx.recv().await.is_some());
        assert_eq!(network.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let (network, _recorder, _rx) = network_with_recorder();
        let msg = CoordinationMessage::new(MessageType::Heartbeat, None, "a");
        let err = network.send(&"zz".to_string(), msg).await.unwrap_err();
        assert!(matches!(err, Error::ParticipantUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_drop_rule_is_silent() {
        let (network, _recorder, mut rx) = network_with_recorder();
        network.add_drop_rule(DropRule::to("b").of_type(MessageType::Commit));

        let commit = CoordinationMessage::new(MessageType::Commit, None, "a");
        network.send(&"b".to_string(), commit).await.unwrap();
        let abort = CoordinationMessage::new(MessageType::Abort, None, "a");
        network.send(&"b".to_string(), abort).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.message_type, MessageType::Abort);
        assert_eq!(network.stats().dropped, 1);
    }
}
