use crate::features::transactions::transaction::TransactionId;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::{debug, warn};

/// A detected wait-for cycle and the transaction chosen to break it
#[derive(Debug, Clone, Serialize)]
pub struct DeadlockInfo {
    /// Transactions on the cycle, in wait order
    pub cycle: Vec<TransactionId>,
    pub detected_at: SystemTime,
    pub victim: TransactionId,
    pub reason: String,
}

/// Transaction information used for victim selection
#[derive(Debug, Clone, Copy)]
pub struct TxDeadlockInfo {
    pub start_time: Instant,
    /// Begin order, breaks ties between identical start instants
    pub sequence: u64,
}

/// Wait-for graph: tx -> set of transactions it waits on
#[derive(Debug, Default, Clone)]
pub struct WaitForGraph {
    edges: HashMap<TransactionId, HashSet<TransactionId>>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the out-edges of `waiter`. A transaction waits on one resource at a time,
    /// so its edges always point at that resource's current holders.
    pub fn set_waits<I>(&mut self, waiter: &TransactionId, holders: I)
    where
        I: IntoIterator<Item = TransactionId>,
    {
        let targets: HashSet<TransactionId> =
            holders.into_iter().filter(|h| h != waiter).collect();
        if targets.is_empty() {
            self.edges.remove(waiter);
        } else {
            self.edges.insert(waiter.clone(), targets);
        }
    }

    pub fn add_edge(&mut self, waiter: TransactionId, holder: TransactionId) {
        if waiter == holder {
            return;
        }
        self.edges.entry(waiter).or_default().insert(holder);
    }

    pub fn clear_waits(&mut self, waiter: &TransactionId) {
        self.edges.remove(waiter);
    }

    /// Drop a transaction and every edge pointing at it
    pub fn remove_transaction(&mut self, tx_id: &TransactionId) {
        self.edges.remove(tx_id);
        self.edges.retain(|_, targets| {
            targets.remove(tx_id);
            !targets.is_empty()
        });
    }

    pub fn waits_on(&self, waiter: &TransactionId) -> Option<&HashSet<TransactionId>> {
        self.edges.get(waiter)
    }

    pub fn waiters(&self) -> Vec<TransactionId> {
        let mut waiters: Vec<_> = self.edges.keys().cloned().collect();
        waiters.sort();
        waiters
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(|set| set.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Depth-first search from `start`. A node revisited while still on the current
    /// path closes a cycle; the returned vector is that cycle in wait order.
    pub fn find_cycle_from(&self, start: &TransactionId) -> Option<Vec<TransactionId>> {
        let mut path: Vec<TransactionId> = Vec::new();
        let mut on_path: HashSet<TransactionId> = HashSet::new();
        let mut finished: HashSet<TransactionId> = HashSet::new();
        self.dfs(start, &mut path, &mut on_path, &mut finished)
    }

    fn dfs(
        &self,
        tx_id: &TransactionId,
        path: &mut Vec<TransactionId>,
        on_path: &mut HashSet<TransactionId>,
        finished: &mut HashSet<TransactionId>,
    ) -> Option<Vec<TransactionId>> {
        path.push(tx_id.clone());
        on_path.insert(tx_id.clone());

        if let Some(targets) = self.edges.get(tx_id) {
            let mut targets: Vec<&TransactionId> = targets.iter().collect();
            targets.sort();
            for next in targets {
                if on_path.contains(next) {
                    let pos = path.iter().position(|t| t == next).unwrap_or(0);
                    return Some(path[pos..].to_vec());
                }
                if !finished.contains(next) {
                    if let Some(cycle) = self.dfs(next, path, on_path, finished) {
                        return Some(cycle);
                    }
                }
            }
        }

        path.pop();
        on_path.remove(tx_id);
        finished.insert(tx_id.clone());
        None
    }
}

/// Wait-for graph plus the bookkeeping needed to pick a victim
#[derive(Debug)]
pub struct DeadlockDetector {
    wait_graph: Mutex<WaitForGraph>,
    tx_info: DashMap<TransactionId, TxDeadlockInfo>,
    sequence: AtomicU64,
    deadlocks_detected: Arc<AtomicU64>,
}

impl Default for DeadlockDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl DeadlockDetector {
    pub fn new() -> Self {
        Self {
            wait_graph: Mutex::new(WaitForGraph::new()),
            tx_info: DashMap::new(),
            sequence: AtomicU64::new(0),
            deadlocks_detected: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a new transaction
    pub fn register_transaction(&self, tx_id: &TransactionId, start_time: Instant) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.tx_info.insert(
            tx_id.clone(),
            TxDeadlockInfo {
                start_time,
                sequence,
            },
        );
    }

    /// Unregister a transaction (on commit/abort)
    pub fn unregister_transaction(&self, tx_id: &TransactionId) {
        self.tx_info.remove(tx_id);
        self.wait_graph.lock().remove_transaction(tx_id);
    }

    pub fn set_waits<I>(&self, waiter: &TransactionId, holders: I)
    where
        I: IntoIterator<Item = TransactionId>,
    {
        self.wait_graph.lock().set_waits(waiter, holders);
    }

    pub fn clear_waits(&self, waiter: &TransactionId) {
        self.wait_graph.lock().clear_waits(waiter);
    }

    pub fn graph_snapshot(&self) -> WaitForGraph {
        self.wait_graph.lock().clone()
    }

    pub fn edge_count(&self) -> usize {
        self.wait_graph.lock().edge_count()
    }

    pub fn deadlocks_detected(&self) -> u64 {
        self.deadlocks_detected.load(Ordering::Relaxed)
    }

    /// Search for a cycle reachable from `start` and pick its victim
    pub fn detect_deadlock(&self, start: &TransactionId) -> Option<DeadlockInfo> {
        let cycle = self.wait_graph.lock().find_cycle_from(start)?;
        let victim = self.select_victim(&cycle)?;

        self.deadlocks_detected.fetch_add(1, Ordering::Relaxed);
        warn!(victim = %victim, cycle = ?cycle, "Deadlock detected");

        Some(DeadlockInfo {
            reason: format!(
                "youngest transaction in a cycle of {} transactions",
                cycle.len()
            ),
            cycle,
            detected_at: SystemTime::now(),
            victim,
        })
    }

    /// Scan every waiting transaction, returning the first cycle found
    pub fn detect_any(&self) -> Option<DeadlockInfo> {
        let waiters = self.wait_graph.lock().waiters();
        debug!(waiters = waiters.len(), "Running deadlock sweep");
        waiters.iter().find_map(|tx_id| self.detect_deadlock(tx_id))
    }

    /// The youngest transaction (latest start) on the cycle is the victim, so older
    /// work gets to finish. Unregistered transactions count as oldest.
    fn select_victim(&self, cycle: &[TransactionId]) -> Option<TransactionId> {
        let mut youngest: Option<(&TransactionId, Instant, u64)> = None;

        for tx_id in cycle {
            if let Some(info) = self.tx_info.get(tx_id) {
                let candidate = (info.start_time, info.sequence);
                let newer = match youngest {
                    Some((_, start, seq)) => candidate > (start, seq),
                    None => true,
                };
                if newer {
                    youngest = Some((tx_id, info.start_time, info.sequence));
                }
            }
        }

        youngest
            .map(|(tx_id, _, _)| tx_id.clone())
            .or_else(|| cycle.last().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tx(id: &str) -> TransactionId {
        TransactionId::from(id)
    }

    #[test]
    fn test_cycle_detection() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(tx("t1"), tx("t2"));
        graph.add_edge(tx("t2"), tx("t3"));
        graph.add_edge(tx("t3"), tx("t1"));

        let cycle = graph.find_cycle_from(&tx("t1")).unwrap();
        assert_eq!(cycle, vec![tx("t1"), tx("t2"), tx("t3")]);
    }

    #[test]
    fn test_cycle_not_containing_start() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(tx("t0"), tx("t1"));
        graph.add_edge(tx("t1"), tx("t2"));
        graph.add_edge(tx("t2"), tx("t1"));

        let cycle = graph.find_cycle_from(&tx("t0")).unwrap();
        assert_eq!(cycle, vec![tx("t1"), tx("t2")]);
    }

    #[test]
    fn test_no_false_positives() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(tx("t1"), tx("t2"));
        graph.add_edge(tx("t1"), tx("t3"));
        graph.add_edge(tx("t2"), tx("t3"));

        assert!(graph.find_cycle_from(&tx("t1")).is_none());
        // self edges are ignored
        graph.add_edge(tx("t4"), tx("t4"));
        assert!(graph.find_cycle_from(&tx("t4")).is_none());
    }

    #[test]
    fn test_remove_transaction_breaks_cycle() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(tx("t1"), tx("t2"));
        graph.add_edge(tx("t2"), tx("t1"));
        graph.remove_transaction(&tx("t2"));

        assert!(graph.find_cycle_from(&tx("t1")).is_none());
        assert!(graph.is_empty());
    }

    #[test]
    fn test_youngest_victim() {
        let detector = DeadlockDetector::new();
        let base = Instant::now();
        detector.register_transaction(&tx("old"), base);
        detector.register_transaction(&tx("young"), base + Duration::from_millis(5));
        detector.register_transaction(&tx("mid"), base + Duration::from_millis(2));

        detector.set_waits(&tx("old"), [tx("mid")]);
        detector.set_waits(&tx("mid"), [tx("young")]);
        detector.set_waits(&tx("young"), [tx("old")]);

        let info = detector.detect_deadlock(&tx("old")).unwrap();
        assert_eq!(info.victim, tx("young"));
        assert_eq!(info.cycle.len(), 3);
        assert_eq!(detector.deadlocks_detected(), 1);

        detector.unregister_transaction(&tx("young"));
        assert!(detector.detect_any().is_none());
    }

    #[test]
    fn test_equal_start_breaks_tie_by_sequence() {
        let detector = DeadlockDetector::new();
        let now = Instant::now();
        detector.register_transaction(&tx("first"), now);
        detector.register_transaction(&tx("second"), now);

        detector.set_waits(&tx("first"), [tx("second")]);
        detector.set_waits(&tx("second"), [tx("first")]);

        let info = detector.detect_any().unwrap();
        assert_eq!(info.victim, tx("second"));
    }
}
