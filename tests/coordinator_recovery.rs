mod common;

use bytes::Bytes;
use common::*;
use lightning_txn::features::cluster::MessagePayload;
use lightning_txn::{
    ClusterEvent, CoordinationMessage, DistributedPhase, MessageType, RecoveryStrategy,
    TransactionId, TransactionState,
};
use std::time::Duration;

const SETTLE: Duration = Duration::from_secs(3);

fn prepare_from(coordinator: &str, tx: &TransactionId, participants: &[&str]) -> CoordinationMessage {
    CoordinationMessage::for_transaction(MessageType::Prepare, tx, coordinator).with_data(
        MessagePayload::Participants {
            coordinator_id: coordinator.to_string(),
            participants: participants.iter().map(|p| p.to_string()).collect(),
        },
    )
}

async fn wait_for_recovery(
    events: &mut tokio::sync::broadcast::Receiver<ClusterEvent>,
) -> lightning_txn::RecoveryInfo {
    tokio::time::timeout(SETTLE, async {
        loop {
            if let Ok(ClusterEvent::RecoveryCompleted(info)) = events.recv().await {
                return info;
            }
        }
    })
    .await
    .expect("recovery did not complete")
}

/// The coordinator got COMMIT to two of three participants and died before
/// committing locally or reaching the third
#[tokio::test]
async fn test_inquiry_recovery_forces_commit() {
    let cluster = TestCluster::new(&["node-a", "node-b", "node-c", "node-d"]);
    let participants = ["node-b", "node-c", "node-d"];
    let tx = cluster.begin("node-a", &participants).await;
    for id in participants {
        cluster.node(id).tm().write(&tx, "k", "v").await.unwrap();
    }

    let prepare = prepare_from("node-a", &tx, &participants);
    for id in participants {
        cluster.node(id).coordinator.handle_message(prepare.clone()).await.unwrap();
        assert_eq!(cluster.node(id).state(&tx).await, Some(TransactionState::Prepared));
    }
    let commit = CoordinationMessage::for_transaction(MessageType::Commit, &tx, "node-a");
    for id in ["node-c", "node-d"] {
        cluster.node(id).coordinator.handle_message(commit.clone()).await.unwrap();
        assert_eq!(cluster.node(id).state(&tx).await, Some(TransactionState::Committed));
    }

    cluster.network.disconnect("node-a");
    let b = cluster.node("node-b");
    let mut events = b.coordinator.subscribe();
    b.coordinator.remove_node("node-a").await.unwrap();

    let info = wait_for_recovery(&mut events).await;
    assert_eq!(info.tx_id, tx);
    assert_eq!(info.last_phase, DistributedPhase::Preparing);
    assert_eq!(info.strategy, RecoveryStrategy::Inquiry);
    assert_eq!(info.outcome, TransactionState::Committed);
    assert!(info
        .participant_states
        .values()
        .any(|s| *s == Some(TransactionState::Committed)));

    assert_eq!(b.state(&tx).await, Some(TransactionState::Committed));
    assert_eq!(b.store.get("k"), Some(Bytes::from("v")));
    for id in ["node-c", "node-d"] {
        let node = cluster.node(id);
        assert_eq!(node.state(&tx).await, Some(TransactionState::Committed));
        assert_eq!(node.tm().metrics().committed, 1);
    }
    let dtx = b.coordinator.distributed_transaction(&tx).unwrap();
    assert_eq!(dtx.coordinator_id, "node-b");
    assert_eq!(dtx.outcome, Some(TransactionState::Committed));
}

#[tokio::test]
async fn test_inquiry_without_commit_aborts() {
    let cluster = TestCluster::new(&["node-a", "node-b", "node-c"]);
    let participants = ["node-b", "node-c"];
    let tx = cluster.begin("node-a", &participants).await;
    for id in participants {
        let node = cluster.node(id);
        node.store.insert("k", "old");
        node.tm().write(&tx, "k", "new").await.unwrap();
    }

    let prepare = prepare_from("node-a", &tx, &participants);
    for id in participants {
        cluster.node(id).coordinator.handle_message(prepare.clone()).await.unwrap();
    }

    cluster.network.disconnect("node-a");
    let b = cluster.node("node-b");
    let mut events = b.coordinator.subscribe();
    b.coordinator.remove_node("node-a").await.unwrap();

    let info = wait_for_recovery(&mut events).await;
    assert_eq!(info.strategy, RecoveryStrategy::Inquiry);
    assert_eq!(info.outcome, TransactionState::Aborted);

    for id in participants {
        let node = cluster.node(id);
        assert!(wait_for_state(node.tm(), &tx, TransactionState::Aborted, SETTLE).await);
        assert_eq!(node.store.get("k"), Some(Bytes::from("old")));
    }
}

#[tokio::test]
async fn test_unprepared_branch_aborts_without_inquiry() {
    let cluster = TestCluster::new(&["node-a", "node-b", "node-c"]);
    let participants = ["node-b", "node-c"];
    let tx = cluster.begin("node-a", &participants).await;

    // node-b aborted its branch on its own before the prepare
    let b = cluster.node("node-b");
    b.tm().abort_transaction(&tx, "local").await.unwrap();
    let prepare = prepare_from("node-a", &tx, &participants);
    b.coordinator.handle_message(prepare.clone()).await.unwrap();
    cluster.node("node-c").coordinator.handle_message(prepare).await.unwrap();

    cluster.network.disconnect("node-a");
    let mut events = b.coordinator.subscribe();
    b.coordinator.remove_node("node-a").await.unwrap();

    let info = wait_for_recovery(&mut events).await;
    assert_eq!(info.last_phase, DistributedPhase::Aborting);
    assert_eq!(info.strategy, RecoveryStrategy::Abort);
    assert!(
        wait_for_state(cluster.node("node-c").tm(), &tx, TransactionState::Aborted, SETTLE).await
    );
}

/// Wait until exactly one node coordinates and every node follows it
async fn settled_leader(cluster: &TestCluster) -> String {
    let mut leader = None;
    let agreed = wait_until(SETTLE, || {
        let coordinators: Vec<_> = cluster
            .nodes
            .iter()
            .filter(|n| n.coordinator.is_coordinator())
            .collect();
        if coordinators.len() != 1 {
            return false;
        }
        let id = coordinators[0].id();
        let followed = cluster
            .nodes
            .iter()
            .all(|n| n.coordinator.coordinator_id().as_deref() == Some(id.as_str()));
        if followed {
            leader = Some(id);
        }
        followed
    })
    .await;
    assert!(agreed, "cluster did not settle on one coordinator");
    leader.unwrap()
}

/// A transaction coordinated by a node that is not the cluster coordinator. Its
/// participant must notice the silence and recover on its own.
#[tokio::test]
async fn test_follower_coordinator_failure_recovers_branch() {
    let cluster = TestCluster::new(&["node-a", "node-b", "node-c"]);
    cluster.start();
    let leader = settled_leader(&cluster).await;
    let followers: Vec<&TestNode> = cluster.nodes.iter().filter(|n| n.id() != leader).collect();
    let (owner, branch) = (followers[0], followers[1]);
    let (owner_id, branch_id) = (owner.id(), branch.id());

    let tx = cluster.begin(&owner_id, &[branch_id.as_str()]).await;
    branch.tm().write(&tx, "k", "v").await.unwrap();
    branch
        .coordinator
        .handle_message(prepare_from(&owner_id, &tx, &[branch_id.as_str()]))
        .await
        .unwrap();
    assert_eq!(branch.state(&tx).await, Some(TransactionState::Prepared));

    // Keepalives flow while the transaction is open, so nothing fails early
    tokio::time::sleep(branch.coordinator.config().failure_timeout * 2).await;
    assert!(branch.coordinator.node(&owner_id).is_some());

    let mut events = branch.coordinator.subscribe();
    cluster.network.disconnect(&owner_id);

    let info = wait_for_recovery(&mut events).await;
    assert_eq!(info.tx_id, tx);
    assert_eq!(info.strategy, RecoveryStrategy::Inquiry);
    assert_eq!(info.outcome, TransactionState::Aborted);

    assert_eq!(branch.state(&tx).await, Some(TransactionState::Aborted));
    assert_eq!(branch.store.get("k"), None);
    assert!(branch.tm().lock_manager().lock_info("k").is_none());
    assert!(branch.coordinator.node(&owner_id).is_none());
    // The cluster coordinator was never involved and keeps its role
    assert!(cluster.node(&leader).coordinator.is_coordinator());
    cluster.shutdown().await;
}

/// Coordinator goes silent after COMMIT reached one participant: heartbeat loss,
/// failure detection, recovery and the same outcome on every participant
#[tokio::test]
async fn test_silent_coordinator_detected_and_recovered() {
    let cluster = TestCluster::new(&["node-a", "node-b", "node-c"]);
    cluster.start();
    let leader = settled_leader(&cluster).await;
    let participants: Vec<String> = cluster
        .nodes
        .iter()
        .map(|n| n.id())
        .filter(|id| *id != leader)
        .collect();
    let names: Vec<&str> = participants.iter().map(|p| p.as_str()).collect();

    let tx = cluster.begin(&leader, &names).await;
    for id in &names {
        cluster.node(id).tm().write(&tx, "k", "v").await.unwrap();
    }
    let prepare = prepare_from(&leader, &tx, &names);
    for id in &names {
        cluster.node(id).coordinator.handle_message(prepare.clone()).await.unwrap();
    }
    let commit = CoordinationMessage::for_transaction(MessageType::Commit, &tx, leader.clone());
    cluster.node(names[1]).coordinator.handle_message(commit).await.unwrap();

    let mut failures: Vec<_> = names
        .iter()
        .map(|id| cluster.node(id).coordinator.subscribe())
        .collect();
    cluster.network.disconnect(&leader);

    for id in &names {
        let node = cluster.node(id);
        assert!(
            wait_for_state(node.tm(), &tx, TransactionState::Committed, SETTLE).await,
            "{} did not reach the committed outcome",
            id
        );
        assert_eq!(node.store.get("k"), Some(Bytes::from("v")));
        assert!(node.tm().lock_manager().get_lock_info().is_empty());
    }
    for events in &mut failures {
        let detected = tokio::time::timeout(SETTLE, async {
            loop {
                match events.recv().await {
                    Ok(ClusterEvent::NodeFailed(id)) if id == leader => return true,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return false,
                    _ => {}
                }
            }
        })
        .await;
        assert_eq!(
            detected.ok(),
            Some(true),
            "coordinator failure was not detected by heartbeat loss"
        );
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_election_picks_single_coordinator() {
    let cluster = TestCluster::new(&["node-a", "node-b", "node-c"]);
    cluster.start();

    let agreed = wait_until(SETTLE, || {
        let coordinators: Vec<_> = cluster
            .nodes
            .iter()
            .filter(|n| n.coordinator.is_coordinator())
            .collect();
        if coordinators.len() != 1 {
            return false;
        }
        let leader = coordinators[0].id();
        cluster
            .nodes
            .iter()
            .all(|n| n.coordinator.coordinator_id().as_deref() == Some(leader.as_str()))
    })
    .await;
    assert!(agreed, "cluster did not settle on one coordinator");

    let terms: Vec<u64> = cluster.nodes.iter().map(|n| n.coordinator.current_term()).collect();
    assert!(terms.iter().all(|t| *t == terms[0] && *t >= 1));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_failed_participant_detected_by_coordinator() {
    let cluster = TestCluster::new(&["node-a", "node-b", "node-c"]);
    cluster.start();
    assert!(
        wait_until(SETTLE, || cluster.nodes.iter().any(|n| n.coordinator.is_coordinator())).await
    );
    let leader = cluster
        .nodes
        .iter()
        .find(|n| n.coordinator.is_coordinator())
        .unwrap();
    let victim = cluster
        .nodes
        .iter()
        .find(|n| !n.coordinator.is_coordinator())
        .unwrap()
        .id();

    let mut events = leader.coordinator.subscribe();
    cluster.network.disconnect(&victim);

    assert!(wait_until(SETTLE, || leader.coordinator.node(&victim).is_none()).await);
    let mut failed = false;
    while let Ok(event) = events.try_recv() {
        if matches!(&event, ClusterEvent::NodeFailed(id) if *id == victim) {
            failed = true;
        }
    }
    assert!(failed);
    assert!(leader.coordinator.is_coordinator());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_coordinator_loss_triggers_reelection() {
    let cluster = TestCluster::new(&["node-a", "node-b", "node-c"]);
    cluster.start();
    assert!(
        wait_until(SETTLE, || cluster.nodes.iter().any(|n| n.coordinator.is_coordinator())).await
    );
    let old = cluster
        .nodes
        .iter()
        .find(|n| n.coordinator.is_coordinator())
        .unwrap();
    let old_id = old.id();
    let old_term = old.coordinator.current_term();
    cluster.network.disconnect(&old_id);

    let survivors: Vec<_> = cluster.nodes.iter().filter(|n| n.id() != old_id).collect();
    let reelected = wait_until(Duration::from_secs(6), || {
        survivors.iter().any(|n| n.coordinator.is_coordinator())
            && survivors.iter().all(|n| {
                n.coordinator
                    .coordinator_id()
                    .map_or(false, |c| c != old_id)
            })
    })
    .await;
    assert!(reelected, "survivors did not elect a new coordinator");

    let new_leader = survivors
        .iter()
        .find(|n| n.coordinator.is_coordinator())
        .unwrap();
    assert!(new_leader.coordinator.current_term() > old_term);
    cluster.shutdown().await;
}
