#![allow(dead_code)]

use lightning_txn::{
    ClusterConfig, DistributedCoordinator, InMemoryStore, InProcessNetwork, MessageHandler,
    TransactionConfig, TransactionId, TransactionManager, TransactionState, Transport,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("lightning_txn=debug")
        .with_test_writer()
        .try_init();
}

/// Timeouts small enough for tests, large enough not to fire by accident
pub fn fast_tx_config() -> TransactionConfig {
    TransactionConfig {
        lock_timeout: Duration::from_millis(500),
        deadlock_check_interval: Duration::from_millis(50),
        transaction_timeout: Duration::from_secs(10),
        ..Default::default()
    }
}

pub fn fast_cluster_config(node_id: &str) -> ClusterConfig {
    ClusterConfig {
        heartbeat_interval: Duration::from_millis(50),
        failure_timeout: Duration::from_millis(400),
        election_timeout: Duration::from_millis(250),
        election_jitter: Duration::from_millis(100),
        prepare_timeout: Duration::from_secs(3),
        recovery_timeout: Duration::from_millis(500),
        max_retry_attempts: 2,
        retry_backoff: Duration::from_millis(10),
        ..ClusterConfig::new(node_id, format!("local://{}", node_id))
    }
}

pub fn local_manager() -> (Arc<TransactionManager>, Arc<InMemoryStore>) {
    local_manager_with(fast_tx_config())
}

pub fn local_manager_with(config: TransactionConfig) -> (Arc<TransactionManager>, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let tm = TransactionManager::new(config, store.clone());
    (tm, store)
}

pub struct TestNode {
    pub coordinator: Arc<DistributedCoordinator>,
    pub store: Arc<InMemoryStore>,
}

impl TestNode {
    pub fn tm(&self) -> &Arc<TransactionManager> {
        self.coordinator.transaction_manager()
    }

    pub fn id(&self) -> String {
        self.coordinator.node_id().clone()
    }

    pub async fn state(&self, tx_id: &TransactionId) -> Option<TransactionState> {
        self.tm().transaction_state(tx_id).await
    }
}

/// Fully meshed in-process cluster. Background loops are not started; call
/// `start` for tests that need heartbeats and elections.
pub struct TestCluster {
    pub network: Arc<InProcessNetwork>,
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    pub fn new(ids: &[&str]) -> Self {
        Self::with_config(ids, fast_cluster_config)
    }

    pub fn with_config(ids: &[&str], config: impl Fn(&str) -> ClusterConfig) -> Self {
        let network = Arc::new(InProcessNetwork::new());
        let transport: Arc<dyn Transport> = network.clone();

        let nodes: Vec<TestNode> = ids
            .iter()
            .map(|id| {
                let (tm, store) = local_manager();
                let coordinator =
                    DistributedCoordinator::new(config(id), tm, transport.clone()).unwrap();
                let handler: Arc<dyn MessageHandler> = coordinator.clone();
                network.register(*id, Arc::downgrade(&handler));
                TestNode { coordinator, store }
            })
            .collect();

        for node in &nodes {
            for id in ids {
                if *id != node.coordinator.node_id() {
                    node.coordinator
                        .add_node(*id, format!("local://{}", id))
                        .unwrap();
                }
            }
        }
        Self { network, nodes }
    }

    pub fn start(&self) {
        for node in &self.nodes {
            node.coordinator.start().unwrap();
        }
    }

    pub fn node(&self, id: &str) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.coordinator.node_id() == id)
            .unwrap()
    }

    /// Begin a transaction coordinated by `coordinator` and join every listed
    /// participant's branch under the same id
    pub async fn begin(&self, coordinator: &str, participants: &[&str]) -> TransactionId {
        let ids: Vec<String> = participants.iter().map(|p| p.to_string()).collect();
        let tx_id = self
            .node(coordinator)
            .coordinator
            .begin_distributed_transaction(None, ids)
            .await
            .unwrap();
        for participant in participants {
            self.node(participant)
                .coordinator
                .join_transaction(tx_id.clone(), &coordinator.to_string())
                .await
                .unwrap();
        }
        tx_id
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            let _ = node.coordinator.shutdown().await;
        }
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_state(
    tm: &TransactionManager,
    tx_id: &TransactionId,
    expected: TransactionState,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if tm.transaction_state(tx_id).await == Some(expected) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
