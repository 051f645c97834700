use super::isolation::{
    DeadlockInfo, DeadlockResolver, IsolationLevel, LockDurationPolicy, LockManager, LockType,
};
use super::storage::ResourceStore;
use super::transaction::{
    Transaction, TransactionId, TransactionOptions, TransactionState, TransactionSummary,
    WriteEntry,
};
use crate::config::duration_ms;
use crate::core::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    #[serde(with = "duration_ms")]
    pub lock_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub deadlock_check_interval: Duration,
    #[serde(with = "duration_ms")]
    pub transaction_timeout: Duration,
    pub default_isolation: IsolationLevel,
    pub max_concurrent_transactions: usize,
    /// How long terminal outcomes are remembered after cleanup
    #[serde(with = "duration_ms")]
    pub completed_retention: Duration,
    pub enable_deadlock_detection: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            deadlock_check_interval: Duration::from_secs(5),
            transaction_timeout: Duration::from_secs(30),
            default_isolation: IsolationLevel::ReadCommitted,
            max_concurrent_transactions: 10_000,
            completed_retention: Duration::from_secs(300),
            enable_deadlock_detection: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum TransactionEvent {
    Started {
        tx_id: TransactionId,
        isolation_level: IsolationLevel,
    },
    Committed(TransactionId),
    Aborted {
        tx_id: TransactionId,
        reason: String,
    },
    DeadlockDetected(DeadlockInfo),
    TimedOut(TransactionId),
}

/// Runs two-phase commit for transactions that have participants. Registered by
/// the distributed coordinator of the same node.
#[async_trait]
pub trait CommitHook: Send + Sync {
    async fn commit_distributed(&self, tx_id: &TransactionId) -> Result<()>;
}

#[derive(Debug, Default)]
struct TransactionMetrics {
    started: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    timed_out: AtomicU64,
    deadlocks: AtomicU64,
    lock_timeouts: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionMetricsSnapshot {
    pub started: u64,
    pub committed: u64,
    pub aborted: u64,
    pub timed_out: u64,
    pub deadlocks: u64,
    pub lock_timeouts: u64,
    pub active: usize,
}

#[derive(Debug, Clone)]
struct CompletedTransaction {
    state: TransactionState,
    reason: Option<String>,
    timed_out: bool,
    finished_at: Instant,
}

type TransactionHandle = Arc<Mutex<Transaction>>;

/// Local transaction lifecycle: locking reads and writes, savepoints, commit and
/// rollback, per-transaction timeout
pub struct TransactionManager {
    config: TransactionConfig,
    transactions: DashMap<TransactionId, TransactionHandle>,
    completed: DashMap<TransactionId, CompletedTransaction>,
    timers: DashMap<TransactionId, JoinHandle<()>>,
    lock_manager: Arc<LockManager>,
    store: Arc<dyn ResourceStore>,
    commit_hook: RwLock<Option<Weak<dyn CommitHook>>>,
    event_bus: broadcast::Sender<TransactionEvent>,
    shutdown_tx: broadcast::Sender<()>,
    metrics: TransactionMetrics,
    shutdown: AtomicBool,
    self_ref: Weak<TransactionManager>,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("active", &self.transactions.len())
            .field("completed", &self.completed.len())
            .finish()
    }
}

impl TransactionManager {
    pub fn new(config: TransactionConfig, store: Arc<dyn ResourceStore>) -> Arc<Self> {
        let lock_manager = Arc::new(LockManager::new(
            config.lock_timeout,
            config.enable_deadlock_detection,
        ));
        let (event_bus, _) = broadcast::channel(1024);
        let (shutdown_tx, _) = broadcast::channel(1);

        let manager = Arc::new_cyclic(|self_ref| Self {
            config,
            transactions: DashMap::new(),
            completed: DashMap::new(),
            timers: DashMap::new(),
            lock_manager,
            store,
            commit_hook: RwLock::new(None),
            event_bus,
            shutdown_tx,
            metrics: TransactionMetrics::default(),
            shutdown: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        });

        let resolver: Arc<dyn DeadlockResolver> = manager.clone();
        manager.lock_manager.set_resolver(Arc::downgrade(&resolver));
        manager
    }

    /// Start the background deadlock sweep. The same loop purges expired
    /// completed-outcome entries.
    pub fn start(&self) -> JoinHandle<()> {
        let weak = self.self_ref.clone();
        let interval = self.config.deadlock_check_interval;
        let sweep_deadlocks = self.config.enable_deadlock_detection;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(manager) = weak.upgrade() else {
                            break;
                        };
                        if sweep_deadlocks {
                            let resolved = manager.lock_manager.sweep_deadlocks().await;
                            if resolved > 0 {
                                info!(resolved, "Deadlock sweep aborted victims");
                            }
                        }
                        manager.purge_completed();
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        })
    }

    pub fn set_commit_hook(&self, hook: Weak<dyn CommitHook>) {
        *self.commit_hook.write() = Some(hook);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransactionEvent> {
        self.event_bus.subscribe()
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    pub async fn begin_transaction(
        &self,
        id: Option<TransactionId>,
        options: TransactionOptions,
    ) -> Result<TransactionId> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        if self.transactions.len() >= self.config.max_concurrent_transactions {
            return Err(Error::TransactionLimitReached {
                limit: self.config.max_concurrent_transactions,
            });
        }

        let tx_id = id.unwrap_or_default();
        if self.completed.contains_key(&tx_id) {
            return Err(Error::TransactionExists {
                id: tx_id.to_string(),
            });
        }

        let isolation_level = options
            .isolation_level
            .unwrap_or(self.config.default_isolation);
        let timeout = options.timeout.unwrap_or(self.config.transaction_timeout);
        let transaction = Transaction::new(
            tx_id.clone(),
            isolation_level,
            timeout,
            options.participants,
        );
        let start_time = transaction.start_time;

        match self.transactions.entry(tx_id.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::TransactionExists {
                    id: tx_id.to_string(),
                })
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(Mutex::new(transaction)));
            }
        }

        self.lock_manager.register_transaction(&tx_id, start_time);
        self.spawn_timeout(&tx_id, timeout);

        self.metrics.started.fetch_add(1, Ordering::Relaxed);
        debug!(tx_id = %tx_id, isolation = %isolation_level, "Transaction started");
        let _ = self.event_bus.send(TransactionEvent::Started {
            tx_id: tx_id.clone(),
            isolation_level,
        });

        Ok(tx_id)
    }

    fn spawn_timeout(&self, tx_id: &TransactionId, timeout: Duration) {
        let weak = self.self_ref.clone();
        let id = tx_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(manager) = weak.upgrade() {
                manager.expire_transaction(&id).await;
            }
        });
        self.timers.insert(tx_id.clone(), handle);
    }

    /// Force-abort a transaction that is still active at its deadline. Branches
    /// already preparing or prepared wait for the coordinator's decision instead.
    async fn expire_transaction(&self, tx_id: &TransactionId) {
        self.timers.remove(tx_id);
        let Some(handle) = self.transactions.get(tx_id).map(|h| h.value().clone()) else {
            return;
        };

        let mut tx = handle.lock().await;
        if tx.state != TransactionState::Active {
            return;
        }

        warn!(tx_id = %tx_id, timeout_ms = tx.timeout.as_millis() as u64, "Transaction timed out");
        self.metrics.timed_out.fetch_add(1, Ordering::Relaxed);
        let _ = self.event_bus.send(TransactionEvent::TimedOut(tx_id.clone()));

        if let Err(e) = self.abort_locked(&mut tx, "transaction timeout", true).await {
            warn!(tx_id = %tx_id, error = %e, "Rollback after timeout failed");
        }
    }

    /// Read a resource under the transaction's isolation level
    pub async fn read(&self, tx_id: &TransactionId, resource: &str) -> Result<Option<Bytes>> {
        let handle = self.handle(tx_id)?;
        let (policy, already_held) = {
            let tx = handle.lock().await;
            Self::ensure_active(&tx)?;
            (
                tx.isolation_level.lock_duration_policy(),
                tx.holds(resource, LockType::Shared),
            )
        };

        let acquired = policy != LockDurationPolicy::None && !already_held;
        if acquired {
            self.lock(tx_id, resource, LockType::Shared).await?;
        }

        let mut tx = handle.lock().await;
        if let Err(e) = Self::ensure_active(&tx) {
            if acquired {
                self.lock_manager.release_lock(resource, tx_id);
            }
            return Err(e);
        }

        let value = self.store.perform_read(resource).await;
        if acquired {
            match policy {
                LockDurationPolicy::HoldUntilCommit => tx.record_lock(resource, LockType::Shared),
                // Read committed drops the lock as soon as the value is read
                _ => self.lock_manager.release_lock(resource, tx_id),
            }
        }

        let value = value?;
        tx.read_set.insert(resource.to_string());
        Ok(value)
    }

    /// Write-through: exclusive lock, capture the original once, apply to the store
    pub async fn write(
        &self,
        tx_id: &TransactionId,
        resource: &str,
        value: impl Into<Bytes>,
    ) -> Result<()> {
        let value = value.into();
        let handle = self.handle(tx_id)?;
        let already_held = {
            let tx = handle.lock().await;
            Self::ensure_active(&tx)?;
            tx.holds(resource, LockType::Exclusive)
        };

        if !already_held {
            self.lock(tx_id, resource, LockType::Exclusive).await?;
        }

        let mut tx = handle.lock().await;
        if let Err(e) = Self::ensure_active(&tx) {
            if !already_held {
                self.lock_manager.release_lock(resource, tx_id);
            }
            return Err(e);
        }
        tx.record_lock(resource, LockType::Exclusive);

        match tx.write_set.get_mut(resource) {
            Some(entry) => entry.new = value.clone(),
            None => {
                let original = self.store.perform_read(resource).await?;
                tx.write_set.insert(
                    resource.to_string(),
                    WriteEntry {
                        original,
                        new: value.clone(),
                    },
                );
                tx.write_order.push(resource.to_string());
            }
        }

        self.store.perform_write(resource, value).await
    }

    async fn lock(&self, tx_id: &TransactionId, resource: &str, lock_type: LockType) -> Result<()> {
        match self.lock_manager.acquire_lock(tx_id, resource, lock_type).await {
            Err(e @ Error::LockTimeout { .. }) => {
                self.metrics.lock_timeouts.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
            other => other,
        }
    }

    /// Snapshot read set, write set and locks under `name`. Reusing a name replaces
    /// the earlier savepoint.
    pub async fn create_savepoint(&self, tx_id: &TransactionId, name: &str) -> Result<()> {
        let handle = self.handle(tx_id)?;
        let mut tx = handle.lock().await;
        Self::ensure_active(&tx)?;

        tx.savepoints.retain(|sp| sp.name != name);
        let savepoint = tx.snapshot(name);
        tx.savepoints.push(savepoint);
        debug!(tx_id = %tx_id, savepoint = name, "Savepoint created");
        Ok(())
    }

    /// Undo everything done after the savepoint. Resources first written after it go
    /// back to their original value, resources written on both sides go back to the
    /// value they had at the savepoint. Locks taken after it are released, locks
    /// upgraded after it go back to shared, and the savepoint, together with every
    /// later one, is discarded.
    pub async fn rollback_to_savepoint(&self, tx_id: &TransactionId, name: &str) -> Result<()> {
        let handle = self.handle(tx_id)?;
        let mut tx = handle.lock().await;
        Self::ensure_active(&tx)?;

        let pos = tx
            .savepoints
            .iter()
            .position(|sp| sp.name == name)
            .ok_or_else(|| Error::SavepointNotFound {
                tx_id: tx_id.to_string(),
                name: name.to_string(),
            })?;
        let savepoint = tx.savepoints[pos].clone();

        let mut restores: Vec<(String, Option<Bytes>)> = Vec::new();
        for resource in tx.write_order.iter().rev() {
            let Some(current) = tx.write_set.get(resource) else {
                continue;
            };
            match savepoint.write_set.get(resource) {
                Some(saved) if saved.new != current.new => {
                    restores.push((resource.clone(), Some(saved.new.clone())))
                }
                Some(_) => {}
                None => restores.push((resource.clone(), current.original.clone())),
            }
        }
        for (resource, value) in restores {
            self.store.rollback_write(&resource, value).await?;
        }

        let released: Vec<String> = tx
            .locks
            .keys()
            .filter(|r| !savepoint.locks.contains_key(*r))
            .cloned()
            .collect();
        for resource in &released {
            tx.locks.remove(resource);
            self.lock_manager.release_lock(resource, tx_id);
        }
        let downgraded: Vec<String> = tx
            .locks
            .iter()
            .filter(|(r, held)| {
                **held == LockType::Exclusive
                    && savepoint.locks.get(*r) == Some(&LockType::Shared)
            })
            .map(|(r, _)| r.clone())
            .collect();
        for resource in &downgraded {
            tx.locks.insert(resource.clone(), LockType::Shared);
            self.lock_manager.downgrade_lock(resource, tx_id);
        }

        tx.read_set = savepoint.read_set;
        tx.write_set = savepoint.write_set;
        let write_set = &tx.write_set;
        let write_order: Vec<String> = tx
            .write_order
            .iter()
            .filter(|r| write_set.contains_key(*r))
            .cloned()
            .collect();
        tx.write_order = write_order;
        tx.savepoints.truncate(pos);

        debug!(
            tx_id = %tx_id,
            savepoint = name,
            released = released.len(),
            downgraded = downgraded.len(),
            "Rolled back to savepoint"
        );
        Ok(())
    }

    /// Commit. Transactions with participants go through the registered two-phase
    /// commit hook; local ones commit directly.
    pub async fn commit_transaction(&self, tx_id: &TransactionId) -> Result<()> {
        if let Some(done) = self.completed.get(tx_id).map(|c| c.value().clone()) {
            return Self::repeat_commit(tx_id, &done);
        }

        let handle = self.handle(tx_id)?;
        let distributed = handle.lock().await.is_distributed();
        if distributed {
            let hook = self.commit_hook.read().as_ref().and_then(Weak::upgrade);
            match hook {
                Some(hook) => return hook.commit_distributed(tx_id).await,
                None => {
                    warn!(tx_id = %tx_id, "No two-phase commit hook registered, committing locally");
                }
            }
        }

        self.commit_local(tx_id).await
    }

    fn repeat_commit(tx_id: &TransactionId, done: &CompletedTransaction) -> Result<()> {
        match done.state {
            TransactionState::Committed => Ok(()),
            state => Err(Error::InvalidStateTransition {
                id: tx_id.to_string(),
                from: state.to_string(),
                to: TransactionState::Committed.to_string(),
            }),
        }
    }

    /// Finalize this node's branch: writes are already applied, so committing moves
    /// the state to committed and releases every lock
    pub async fn commit_local(&self, tx_id: &TransactionId) -> Result<()> {
        if let Some(done) = self.completed.get(tx_id).map(|c| c.value().clone()) {
            return Self::repeat_commit(tx_id, &done);
        }
        let handle = self.handle(tx_id)?;
        let mut tx = handle.lock().await;

        if tx.state == TransactionState::Active {
            Self::transition(&mut tx, TransactionState::Preparing)?;
        }
        if tx.state == TransactionState::Preparing {
            Self::transition(&mut tx, TransactionState::Prepared)?;
        }
        Self::transition(&mut tx, TransactionState::Committed)?;

        let resources: Vec<String> = tx.locks.keys().cloned().collect();
        self.lock_manager.release_all(tx_id, resources.iter());
        tx.savepoints.clear();
        self.finish(tx_id, TransactionState::Committed, None, false);

        self.metrics.committed.fetch_add(1, Ordering::Relaxed);
        crate::log_transaction!("committed", tx_id.as_str(), tx.start_time.elapsed());
        let _ = self.event_bus.send(TransactionEvent::Committed(tx_id.clone()));
        Ok(())
    }

    /// Participant side of prepare. Returns whether this branch can vote commit,
    /// which is the case only while it is still live.
    pub async fn prepare_transaction(&self, tx_id: &TransactionId) -> Result<bool> {
        if let Some(done) = self.completed.get(tx_id) {
            return Ok(done.state == TransactionState::Committed);
        }
        let handle = self.handle(tx_id)?;
        let mut tx = handle.lock().await;

        match tx.state {
            TransactionState::Active => {
                Self::transition(&mut tx, TransactionState::Preparing)?;
                Self::transition(&mut tx, TransactionState::Prepared)?;
            }
            TransactionState::Preparing => {
                Self::transition(&mut tx, TransactionState::Prepared)?;
            }
            TransactionState::Prepared => {}
            TransactionState::Committed | TransactionState::Aborted => return Ok(false),
        }
        debug!(tx_id = %tx_id, "Transaction prepared");
        Ok(true)
    }

    /// Roll back and release. Aborting a finished transaction is a no-op.
    pub async fn abort_transaction(&self, tx_id: &TransactionId, reason: &str) -> Result<()> {
        if self.completed.contains_key(tx_id) {
            return Ok(());
        }
        let Some(handle) = self.transactions.get(tx_id).map(|h| h.value().clone()) else {
            return Err(Error::TransactionNotFound {
                id: tx_id.to_string(),
            });
        };

        let mut tx = handle.lock().await;
        self.abort_locked(&mut tx, reason, false).await
    }

    async fn abort_locked(&self, tx: &mut Transaction, reason: &str, timed_out: bool) -> Result<()> {
        if tx.state.is_terminal() {
            return Ok(());
        }
        tx.state = TransactionState::Aborted;
        let tx_id = tx.id.clone();

        let mut rollback_error = None;
        for resource in tx.write_order.iter().rev() {
            let Some(entry) = tx.write_set.get(resource) else {
                continue;
            };
            if let Err(e) = self
                .store
                .rollback_write(resource, entry.original.clone())
                .await
            {
                warn!(tx_id = %tx_id, resource = %resource, error = %e, "Rollback of write failed");
                rollback_error.get_or_insert(e);
            }
        }

        let resources: Vec<String> = tx.locks.keys().cloned().collect();
        self.lock_manager.release_all(&tx_id, resources.iter());
        tx.savepoints.clear();
        self.finish(
            &tx_id,
            TransactionState::Aborted,
            Some(reason.to_string()),
            timed_out,
        );

        self.metrics.aborted.fetch_add(1, Ordering::Relaxed);
        info!(
            tx_id = %tx_id,
            reason,
            writes = tx.write_order.len(),
            "Transaction aborted"
        );
        let _ = self.event_bus.send(TransactionEvent::Aborted {
            tx_id,
            reason: reason.to_string(),
        });

        match rollback_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn finish(
        &self,
        tx_id: &TransactionId,
        state: TransactionState,
        reason: Option<String>,
        timed_out: bool,
    ) {
        self.completed.insert(
            tx_id.clone(),
            CompletedTransaction {
                state,
                reason,
                timed_out,
                finished_at: Instant::now(),
            },
        );
        self.transactions.remove(tx_id);
        if let Some((_, timer)) = self.timers.remove(tx_id) {
            timer.abort();
        }
    }

    fn transition(tx: &mut Transaction, next: TransactionState) -> Result<()> {
        if !tx.state.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                id: tx.id.to_string(),
                from: tx.state.to_string(),
                to: next.to_string(),
            });
        }
        tx.state = next;
        Ok(())
    }

    fn ensure_active(tx: &Transaction) -> Result<()> {
        match tx.state {
            TransactionState::Active => Ok(()),
            TransactionState::Aborted => Err(Error::TransactionAborted {
                id: tx.id.to_string(),
                reason: "transaction is no longer active".to_string(),
            }),
            state => Err(Error::InvalidStateTransition {
                id: tx.id.to_string(),
                from: state.to_string(),
                to: TransactionState::Active.to_string(),
            }),
        }
    }

    fn handle(&self, tx_id: &TransactionId) -> Result<TransactionHandle> {
        if let Some(handle) = self.transactions.get(tx_id) {
            return Ok(handle.value().clone());
        }
        match self.completed.get(tx_id).map(|c| c.value().clone()) {
            Some(done) if done.timed_out => Err(Error::TransactionTimeout {
                id: tx_id.to_string(),
            }),
            Some(done) if done.state == TransactionState::Aborted => {
                Err(Error::TransactionAborted {
                    id: tx_id.to_string(),
                    reason: done.reason.unwrap_or_default(),
                })
            }
            Some(done) => Err(Error::InvalidStateTransition {
                id: tx_id.to_string(),
                from: done.state.to_string(),
                to: TransactionState::Active.to_string(),
            }),
            None => Err(Error::TransactionNotFound {
                id: tx_id.to_string(),
            }),
        }
    }

    /// Current state of a live transaction, or the remembered outcome of a finished one
    pub async fn transaction_state(&self, tx_id: &TransactionId) -> Option<TransactionState> {
        let handle = self.transactions.get(tx_id).map(|h| h.value().clone());
        match handle {
            Some(handle) => Some(handle.lock().await.state),
            None => self.completed.get(tx_id).map(|c| c.state),
        }
    }

    pub fn completed_state(&self, tx_id: &TransactionId) -> Option<TransactionState> {
        self.completed.get(tx_id).map(|c| c.state)
    }

    pub async fn get_transaction(&self, tx_id: &TransactionId) -> Option<TransactionSummary> {
        let handle = self.transactions.get(tx_id).map(|h| h.value().clone())?;
        let summary = handle.lock().await.summary();
        Some(summary)
    }

    pub fn active_transactions(&self) -> Vec<TransactionId> {
        let mut ids: Vec<_> = self.transactions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn active_count(&self) -> usize {
        self.transactions.len()
    }

    /// Drop completed-outcome entries older than the retention window
    pub fn purge_completed(&self) -> usize {
        let retention = self.config.completed_retention;
        let before = self.completed.len();
        self.completed
            .retain(|_, done| done.finished_at.elapsed() < retention);
        let purged = before.saturating_sub(self.completed.len());
        if purged > 0 {
            debug!(purged, "Purged completed transaction outcomes");
        }
        purged
    }

    pub fn metrics(&self) -> TransactionMetricsSnapshot {
        TransactionMetricsSnapshot {
            started: self.metrics.started.load(Ordering::Relaxed),
            committed: self.metrics.committed.load(Ordering::Relaxed),
            aborted: self.metrics.aborted.load(Ordering::Relaxed),
            timed_out: self.metrics.timed_out.load(Ordering::Relaxed),
            deadlocks: self.metrics.deadlocks.load(Ordering::Relaxed),
            lock_timeouts: self.metrics.lock_timeouts.load(Ordering::Relaxed),
            active: self.transactions.len(),
        }
    }

    /// Stop background work and abort every transaction that has not reached
    /// prepare. Prepared branches stay in doubt for recovery.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Shutting down transaction manager");
        let _ = self.shutdown_tx.send(());

        let handles: Vec<TransactionHandle> = self
            .transactions
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for handle in handles {
            let mut tx = handle.lock().await;
            if matches!(
                tx.state,
                TransactionState::Active | TransactionState::Preparing
            ) {
                if let Err(e) = self.abort_locked(&mut tx, "shutdown", false).await {
                    warn!(tx_id = %tx.id, error = %e, "Abort during shutdown failed");
                }
            }
        }

        for entry in self.timers.iter() {
            entry.value().abort();
        }
        self.timers.clear();
        Ok(())
    }
}

#[async_trait]
impl DeadlockResolver for TransactionManager {
    async fn resolve_deadlock(&self, info: DeadlockInfo) -> Result<()> {
        self.metrics.deadlocks.fetch_add(1, Ordering::Relaxed);
        let victim = info.victim.clone();
        let reason = format!("deadlock victim: {}", info.reason);
        let _ = self.event_bus.send(TransactionEvent::DeadlockDetected(info));
        self.abort_transaction(&victim, &reason).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::transactions::storage::InMemoryStore;

    fn setup() -> (Arc<TransactionManager>, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let config = TransactionConfig {
            lock_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        (TransactionManager::new(config, store.clone()), store)
    }

    #[tokio::test]
    async fn test_begin_rejects_duplicate_id() {
        let (tm, _) = setup();
        let id = TransactionId::from("t1");
        tm.begin_transaction(Some(id.clone()), TransactionOptions::default())
            .await
            .unwrap();
        let err = tm
            .begin_transaction(Some(id), TransactionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransactionExists { .. }));
    }

    #[tokio::test]
    async fn test_write_keeps_first_original() {
        let (tm, store) = setup();
        store.insert("a", "0");
        let tx = tm
            .begin_transaction(None, TransactionOptions::default())
            .await
            .unwrap();

        tm.write(&tx, "a", "1").await.unwrap();
        tm.write(&tx, "a", "2").await.unwrap();
        assert_eq!(store.get("a"), Some(Bytes::from("2")));

        let handle = tm.handle(&tx).unwrap();
        let entry = handle.lock().await.write_set["a"].clone();
        assert_eq!(entry.original, Some(Bytes::from("0")));
        assert_eq!(entry.new, Bytes::from("2"));
    }

    #[tokio::test]
    async fn test_commit_twice_and_abort_after_commit() {
        let (tm, _) = setup();
        let tx = tm
            .begin_transaction(None, TransactionOptions::default())
            .await
            .unwrap();
        tm.write(&tx, "a", "1").await.unwrap();
        tm.commit_transaction(&tx).await.unwrap();

        tm.commit_transaction(&tx).await.unwrap();
        tm.abort_transaction(&tx, "late").await.unwrap();
        assert_eq!(tm.completed_state(&tx), Some(TransactionState::Committed));
        assert!(tm.lock_manager().lock_info("a").is_none());
    }

    #[tokio::test]
    async fn test_prepare_only_live_branches() {
        let (tm, _) = setup();
        let live = tm
            .begin_transaction(None, TransactionOptions::default())
            .await
            .unwrap();
        let dead = tm
            .begin_transaction(None, TransactionOptions::default())
            .await
            .unwrap();
        tm.abort_transaction(&dead, "test").await.unwrap();

        assert!(tm.prepare_transaction(&live).await.unwrap());
        assert_eq!(
            tm.transaction_state(&live).await,
            Some(TransactionState::Prepared)
        );
        assert!(!tm.prepare_transaction(&dead).await.unwrap());

        // a prepared branch no longer accepts work
        assert!(tm.write(&live, "x", "1").await.is_err());
        tm.commit_local(&live).await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_completed() {
        let store = Arc::new(InMemoryStore::new());
        let config = TransactionConfig {
            completed_retention: Duration::from_millis(0),
            ..Default::default()
        };
        let tm = TransactionManager::new(config, store);
        let tx = tm
            .begin_transaction(None, TransactionOptions::default())
            .await
            .unwrap();
        tm.commit_transaction(&tx).await.unwrap();

        assert_eq!(tm.purge_completed(), 1);
        assert!(tm.completed_state(&tx).is_none());
    }
}
