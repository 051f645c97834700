use super::deadlock::{DeadlockDetector, DeadlockInfo, WaitForGraph};
use crate::core::error::{Error, Result};
use crate::features::transactions::transaction::TransactionId;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Lock modes. Ordered so that `Exclusive > Shared`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    /// Shared lock - allows concurrent readers
    Shared,
    /// Exclusive lock - exclusive access
    Exclusive,
}

impl LockType {
    /// Shared is compatible with shared; every other combination conflicts
    pub fn is_compatible_with(self, other: LockType) -> bool {
        matches!((self, other), (LockType::Shared, LockType::Shared))
    }
}

/// Outcome delivered to a queued request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Grant {
    Granted,
    Cancelled,
}

/// A lock request in the wait queue
#[derive(Debug)]
struct LockRequest {
    tx_id: TransactionId,
    lock_type: LockType,
    enqueued_at: Instant,
    notify: oneshot::Sender<Grant>,
}

/// Lock table entry. Exists only while at least one transaction holds or awaits
/// the resource.
#[derive(Debug)]
pub struct LockInfo {
    pub resource: String,
    pub lock_type: LockType,
    pub holders: HashSet<TransactionId>,
    wait_queue: VecDeque<LockRequest>,
}

impl LockInfo {
    fn new(resource: &str, lock_type: LockType) -> Self {
        Self {
            resource: resource.to_string(),
            lock_type,
            holders: HashSet::new(),
            wait_queue: VecDeque::new(),
        }
    }

    /// Check if a lock mode can be granted to `tx_id` right now
    fn can_grant(&self, tx_id: &TransactionId, lock_type: LockType) -> bool {
        if self.holders.is_empty() {
            return true;
        }
        // Sole holder: re-entrant request or in-place upgrade
        if self.holders.len() == 1 && self.holders.contains(tx_id) {
            return true;
        }
        if self.holders.contains(tx_id) && self.lock_type == LockType::Exclusive {
            return true;
        }
        lock_type.is_compatible_with(self.lock_type)
    }

    fn apply_grant(&mut self, tx_id: &TransactionId, lock_type: LockType) {
        if self.holders.is_empty() {
            self.lock_type = lock_type;
        } else if self.holders.contains(tx_id) && lock_type > self.lock_type {
            self.lock_type = lock_type;
        }
        self.holders.insert(tx_id.clone());
    }

    fn is_idle(&self) -> bool {
        self.holders.is_empty() && self.wait_queue.is_empty()
    }

    pub fn waiting(&self) -> Vec<TransactionId> {
        self.wait_queue.iter().map(|r| r.tx_id.clone()).collect()
    }

    fn snapshot(&self) -> LockSnapshot {
        let mut holders: Vec<_> = self.holders.iter().cloned().collect();
        holders.sort();
        LockSnapshot {
            resource: self.resource.clone(),
            lock_type: self.lock_type,
            holders,
            wait_queue: self
                .wait_queue
                .iter()
                .map(|r| (r.tx_id.clone(), r.lock_type))
                .collect(),
        }
    }
}

/// Point-in-time copy of a lock table entry
#[derive(Debug, Clone, Serialize)]
pub struct LockSnapshot {
    pub resource: String,
    pub lock_type: LockType,
    pub holders: Vec<TransactionId>,
    pub wait_queue: Vec<(TransactionId, LockType)>,
}

/// Aborts deadlock victims. Implemented by the transaction manager that owns the
/// lock manager.
#[async_trait]
pub trait DeadlockResolver: Send + Sync {
    async fn resolve_deadlock(&self, info: DeadlockInfo) -> Result<()>;
}

/// A queued request returned by `request_lock` when the lock was not free
#[derive(Debug)]
pub struct LockWaiter {
    tx_id: TransactionId,
    resource: String,
    lock_type: LockType,
    rx: oneshot::Receiver<Grant>,
}

#[derive(Debug)]
pub enum LockAcquisition {
    Granted,
    Waiting(LockWaiter),
}

#[derive(Debug, Default)]
struct LockManagerMetrics {
    locks_acquired: AtomicU64,
    locks_released: AtomicU64,
    lock_timeouts: AtomicU64,
    lock_conflicts: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LockManagerStats {
    pub locks_acquired: u64,
    pub locks_released: u64,
    pub lock_timeouts: u64,
    pub lock_conflicts: u64,
    pub deadlocks_detected: u64,
    pub locked_resources: usize,
    pub wait_edges: usize,
}

/// Resource lock table with FIFO wait queues and a wait-for graph
pub struct LockManager {
    locks: DashMap<String, LockInfo>,
    /// tx -> resource it is currently queued on
    waiting: DashMap<TransactionId, String>,
    detector: DeadlockDetector,
    victims: DashMap<TransactionId, DeadlockInfo>,
    resolver: RwLock<Option<Weak<dyn DeadlockResolver>>>,
    lock_timeout: Duration,
    enable_deadlock_detection: bool,
    metrics: LockManagerMetrics,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("locked_resources", &self.locks.len())
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}

impl LockManager {
    pub fn new(lock_timeout: Duration, enable_deadlock_detection: bool) -> Self {
        Self {
            locks: DashMap::new(),
            waiting: DashMap::new(),
            detector: DeadlockDetector::new(),
            victims: DashMap::new(),
            resolver: RwLock::new(None),
            lock_timeout,
            enable_deadlock_detection,
            metrics: LockManagerMetrics::default(),
        }
    }

    pub fn set_resolver(&self, resolver: Weak<dyn DeadlockResolver>) {
        *self.resolver.write() = Some(resolver);
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn register_transaction(&self, tx_id: &TransactionId, start_time: Instant) {
        self.detector.register_transaction(tx_id, start_time);
    }

    /// Acquire a lock, blocking up to the configured lock timeout. On conflict the
    /// request is queued, wait-for edges are added and a deadlock scan runs from the
    /// requester straight away.
    pub async fn acquire_lock(
        &self,
        tx_id: &TransactionId,
        resource: &str,
        lock_type: LockType,
    ) -> Result<()> {
        self.acquire_lock_with_timeout(tx_id, resource, lock_type, self.lock_timeout)
            .await
    }

    pub async fn acquire_lock_with_timeout(
        &self,
        tx_id: &TransactionId,
        resource: &str,
        lock_type: LockType,
        timeout: Duration,
    ) -> Result<()> {
        let waiter = match self.request_lock(tx_id, resource, lock_type) {
            LockAcquisition::Granted => return Ok(()),
            LockAcquisition::Waiting(waiter) => waiter,
        };

        if self.enable_deadlock_detection {
            if let Some(info) = self.detect_deadlock(tx_id) {
                self.resolve_deadlock(info).await;
            }
        }

        self.wait(waiter, timeout).await
    }

    /// Non-blocking half of `acquire_lock`
    pub fn request_lock(
        &self,
        tx_id: &TransactionId,
        resource: &str,
        lock_type: LockType,
    ) -> LockAcquisition {
        let mut entry = self
            .locks
            .entry(resource.to_string())
            .or_insert_with(|| LockInfo::new(resource, lock_type));

        if entry.can_grant(tx_id, lock_type) {
            entry.apply_grant(tx_id, lock_type);
            self.metrics.locks_acquired.fetch_add(1, Ordering::Relaxed);
            debug!(tx_id = %tx_id, resource, ?lock_type, "Lock acquired");
            return LockAcquisition::Granted;
        }

        let (notify, rx) = oneshot::channel();
        entry.wait_queue.push_back(LockRequest {
            tx_id: tx_id.clone(),
            lock_type,
            enqueued_at: Instant::now(),
            notify,
        });
        self.waiting.insert(tx_id.clone(), resource.to_string());
        self.detector
            .set_waits(tx_id, entry.holders.iter().cloned().collect::<Vec<_>>());
        self.metrics.lock_conflicts.fetch_add(1, Ordering::Relaxed);
        debug!(
            tx_id = %tx_id,
            resource,
            ?lock_type,
            holders = entry.holders.len(),
            "Lock conflict, queued"
        );

        LockAcquisition::Waiting(LockWaiter {
            tx_id: tx_id.clone(),
            resource: resource.to_string(),
            lock_type,
            rx,
        })
    }

    /// Wait for a queued request until it is granted, cancelled or times out
    pub async fn wait(&self, waiter: LockWaiter, timeout: Duration) -> Result<()> {
        let LockWaiter {
            tx_id,
            resource,
            lock_type,
            mut rx,
        } = waiter;
        let started = Instant::now();

        let outcome = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(grant)) => grant,
            Ok(Err(_)) => Grant::Cancelled,
            Err(_) => {
                if self.cancel_wait(&tx_id, &resource) {
                    self.metrics.lock_timeouts.fetch_add(1, Ordering::Relaxed);
                    warn!(tx_id = %tx_id, resource = %resource, ?lock_type, "Lock wait timed out");
                    return Err(Error::LockTimeout {
                        tx_id: tx_id.to_string(),
                        resource,
                    });
                }
                // Granted or cancelled between the deadline and the cancel
                rx.try_recv().unwrap_or(Grant::Cancelled)
            }
        };

        match outcome {
            Grant::Granted => {
                debug!(
                    tx_id = %tx_id,
                    resource = %resource,
                    wait_ms = started.elapsed().as_millis() as u64,
                    "Lock acquired after wait"
                );
                Ok(())
            }
            Grant::Cancelled => match self.victims.remove(&tx_id) {
                Some((_, info)) => Err(Error::Deadlock {
                    victim: info.victim.to_string(),
                    cycle: info.cycle.iter().map(|t| t.to_string()).collect(),
                }),
                None => Err(Error::TransactionAborted {
                    id: tx_id.to_string(),
                    reason: format!("lock wait on {} cancelled", resource),
                }),
            },
        }
    }

    /// Remove a still-queued request. Returns false when it already left the queue.
    fn cancel_wait(&self, tx_id: &TransactionId, resource: &str) -> bool {
        let mut removed = false;
        if let Entry::Occupied(mut occupied) = self.locks.entry(resource.to_string()) {
            let info = occupied.get_mut();
            let before = info.wait_queue.len();
            info.wait_queue.retain(|r| &r.tx_id != tx_id);
            removed = info.wait_queue.len() != before;
            if removed {
                self.grant_waiters(info);
            }
            if info.is_idle() {
                occupied.remove();
            }
        }
        if removed {
            self.waiting.remove(tx_id);
            self.detector.clear_waits(tx_id);
        }
        removed
    }

    /// Release one lock. If the wait queue is non-empty the lock passes to the next
    /// waiter(s); otherwise the entry is removed.
    pub fn release_lock(&self, resource: &str, tx_id: &TransactionId) {
        if let Entry::Occupied(mut occupied) = self.locks.entry(resource.to_string()) {
            let info = occupied.get_mut();
            if info.holders.remove(tx_id) {
                self.metrics.locks_released.fetch_add(1, Ordering::Relaxed);
                debug!(tx_id = %tx_id, resource, "Lock released");
            }
            self.grant_waiters(info);
            if info.is_idle() {
                occupied.remove();
            }
        }
    }

    /// Turn an exclusive lock held by `tx_id` back into a shared one and admit
    /// compatible waiters. Returns false if the transaction held no exclusive lock.
    pub fn downgrade_lock(&self, resource: &str, tx_id: &TransactionId) -> bool {
        let Some(mut info) = self.locks.get_mut(resource) else {
            return false;
        };
        if info.lock_type != LockType::Exclusive || !info.holders.contains(tx_id) {
            return false;
        }
        info.lock_type = LockType::Shared;
        self.grant_waiters(&mut info);
        debug!(tx_id = %tx_id, resource, "Lock downgraded to shared");
        true
    }

    /// Release every listed lock and cancel any pending wait of the transaction
    pub fn release_all<'a, I>(&self, tx_id: &TransactionId, resources: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        if let Some((_, resource)) = self.waiting.remove(tx_id) {
            if let Entry::Occupied(mut occupied) = self.locks.entry(resource) {
                let info = occupied.get_mut();
                let mut cancelled = Vec::new();
                let mut kept = VecDeque::with_capacity(info.wait_queue.len());
                for request in info.wait_queue.drain(..) {
                    if &request.tx_id == tx_id {
                        cancelled.push(request);
                    } else {
                        kept.push_back(request);
                    }
                }
                info.wait_queue = kept;
                for request in cancelled {
                    let _ = request.notify.send(Grant::Cancelled);
                }
                self.grant_waiters(info);
                if info.is_idle() {
                    occupied.remove();
                }
            }
        }

        for resource in resources {
            self.release_lock(resource, tx_id);
        }
        self.detector.unregister_transaction(tx_id);
    }

    /// Hand the lock to queued requests in FIFO order for as long as they fit
    fn grant_waiters(&self, info: &mut LockInfo) {
        while let Some(front) = info.wait_queue.front() {
            if !info.can_grant(&front.tx_id, front.lock_type) {
                break;
            }
            let Some(request) = info.wait_queue.pop_front() else {
                break;
            };
            info.apply_grant(&request.tx_id, request.lock_type);
            self.waiting.remove(&request.tx_id);
            self.detector.clear_waits(&request.tx_id);

            if request.notify.send(Grant::Granted).is_err() {
                // The waiter went away; give the lock back
                info.holders.remove(&request.tx_id);
                continue;
            }
            self.metrics.locks_acquired.fetch_add(1, Ordering::Relaxed);
            debug!(
                tx_id = %request.tx_id,
                resource = %info.resource,
                queued_ms = request.enqueued_at.elapsed().as_millis() as u64,
                "Granted pending lock"
            );
        }

        let holders: Vec<TransactionId> = info.holders.iter().cloned().collect();
        for request in &info.wait_queue {
            self.detector.set_waits(&request.tx_id, holders.iter().cloned());
        }
    }

    /// DFS over the wait-for graph from `start_tx`
    pub fn detect_deadlock(&self, start_tx: &TransactionId) -> Option<DeadlockInfo> {
        self.detector.detect_deadlock(start_tx)
    }

    /// Abort the victim through the registered resolver. Without a resolver the
    /// victim's pending wait is cancelled so it fails with `Error::Deadlock`.
    pub async fn resolve_deadlock(&self, info: DeadlockInfo) {
        self.victims.insert(info.victim.clone(), info.clone());
        let resolver = self.resolver.read().as_ref().and_then(Weak::upgrade);

        match resolver {
            Some(resolver) => {
                if let Err(e) = resolver.resolve_deadlock(info.clone()).await {
                    warn!(victim = %info.victim, error = %e, "Failed to abort deadlock victim");
                }
            }
            None => {
                if let Some(resource) = self.waiting.get(&info.victim).map(|r| r.clone()) {
                    self.cancel_victim_wait(&info.victim, &resource);
                }
            }
        }
    }

    fn cancel_victim_wait(&self, tx_id: &TransactionId, resource: &str) {
        if let Entry::Occupied(mut occupied) = self.locks.entry(resource.to_string()) {
            let info = occupied.get_mut();
            if let Some(pos) = info.wait_queue.iter().position(|r| &r.tx_id == tx_id) {
                if let Some(request) = info.wait_queue.remove(pos) {
                    let _ = request.notify.send(Grant::Cancelled);
                }
            }
            self.grant_waiters(info);
            if info.is_idle() {
                occupied.remove();
            }
        }
        self.waiting.remove(tx_id);
        self.detector.clear_waits(tx_id);
    }

    /// Resolve every cycle currently in the graph. Returns the number resolved.
    pub async fn sweep_deadlocks(&self) -> usize {
        let mut resolved = 0;
        // Each resolution removes a victim, so this terminates
        while let Some(info) = self.detector.detect_any() {
            let victim = info.victim.clone();
            self.resolve_deadlock(info).await;
            resolved += 1;
            if self.waiting.contains_key(&victim) {
                // Victim could not be removed, avoid spinning on the same cycle
                break;
            }
        }
        resolved
    }

    pub fn holds_lock(&self, tx_id: &TransactionId, resource: &str, lock_type: LockType) -> bool {
        self.locks
            .get(resource)
            .map(|info| {
                info.holders.contains(tx_id)
                    && (info.lock_type == LockType::Exclusive || lock_type == LockType::Shared)
            })
            .unwrap_or(false)
    }

    pub fn is_waiting(&self, tx_id: &TransactionId) -> bool {
        self.waiting.contains_key(tx_id)
    }

    pub fn lock_info(&self, resource: &str) -> Option<LockSnapshot> {
        self.locks.get(resource).map(|info| info.snapshot())
    }

    /// Get lock information for debugging
    pub fn get_lock_info(&self) -> Vec<LockSnapshot> {
        let mut snapshots: Vec<_> = self.locks.iter().map(|e| e.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.resource.cmp(&b.resource));
        snapshots
    }

    pub fn wait_for_graph(&self) -> WaitForGraph {
        self.detector.graph_snapshot()
    }

    pub fn stats(&self) -> LockManagerStats {
        LockManagerStats {
            locks_acquired: self.metrics.locks_acquired.load(Ordering::Relaxed),
            locks_released: self.metrics.locks_released.load(Ordering::Relaxed),
            lock_timeouts: self.metrics.lock_timeouts.load(Ordering::Relaxed),
            lock_conflicts: self.metrics.lock_conflicts.load(Ordering::Relaxed),
            deadlocks_detected: self.detector.deadlocks_detected(),
            locked_resources: self.locks.len(),
            wait_edges: self.detector.edge_count(),
        }
    }
}
