//! Raft consensus integration tests.
//!
//! In-process clusters over the local network harness: elections,
//! replication, partition failover, and snapshot catch-up.

#[allow(dead_code)]
mod common;

use common::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use strata_raft::{ReplicateResult, Role};

// =============================================================================
// Elections
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_node_cluster_elects_leader() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.wait_for_leader(&cluster.ids()).await;

    let followers: Vec<_> = cluster
        .ids()
        .into_iter()
        .filter(|id| *id != leader)
        .collect();
    for id in followers {
        assert_eq!(cluster.node(id).status().role, Role::Follower);
        assert_eq!(cluster.node(id).leader_id(), Some(leader));
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_leader_per_term() {
    let cluster = TestCluster::start(5).await;
    cluster.wait_for_leader(&cluster.ids()).await;

    // Force a few re-elections while sampling every node.
    let mut leaders: HashMap<u64, u64> = HashMap::new();
    for round in 0..4 {
        for _ in 0..30 {
            for id in cluster.ids() {
                let status = cluster.node(id).status();
                if status.role == Role::Leader {
                    let previous = leaders.insert(status.term, id);
                    assert!(
                        previous.is_none() || previous == Some(id),
                        "two leaders in term {}: {:?} and {}",
                        status.term,
                        previous,
                        id
                    );
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let leader = cluster.wait_for_leader(&cluster.ids()).await;
        cluster.network.isolate(leader);
        let rest: Vec<_> = cluster.ids().into_iter().filter(|id| *id != leader).collect();
        cluster.wait_for_leader(&rest).await;
        cluster.network.heal();
        if round == 3 {
            cluster.wait_for_leader(&cluster.ids()).await;
        }
    }

    cluster.shutdown().await;
}

// =============================================================================
// Replication
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_entries_applied_in_order_on_every_node() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.wait_for_leader(&cluster.ids()).await;

    for i in 1..=10u8 {
        let index = cluster.node(leader).propose(vec![i]).await.unwrap();
        assert_eq!(index, i as u64);
    }
    assert!(cluster.wait_for_applied(&cluster.ids(), 10).await);

    let expected: Vec<_> = (1..=10u8).map(|i| (i as u64, vec![i])).collect();
    for id in cluster.ids() {
        assert_eq!(cluster.applied_of(id), expected, "node {}", id);
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_follower_rejects_proposals() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.wait_for_leader(&cluster.ids()).await;
    let follower = cluster.ids().into_iter().find(|id| *id != leader).unwrap();

    let err = cluster.node(follower).propose(b"nope".to_vec()).await.unwrap_err();
    assert!(matches!(
        err,
        strata_raft::RaftError::NotLeader { leader: Some(l) } if l == leader
    ));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_commit_index_never_decreases() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.wait_for_leader(&cluster.ids()).await;

    let nodes: Vec<_> = cluster
        .ids()
        .into_iter()
        .map(|id| (id, Arc::clone(cluster.node(id))))
        .collect();
    let sampler = tokio::spawn(async move {
        let mut last: HashMap<u64, u64> = HashMap::new();
        for _ in 0..200 {
            for (id, node) in &nodes {
                let committed = node.status().committed_index;
                let previous = last.insert(*id, committed).unwrap_or(0);
                assert!(committed >= previous, "node {} commit went backwards", id);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });

    for i in 0..30u8 {
        cluster.node(leader).propose(vec![i]).await.unwrap();
    }
    sampler.await.unwrap();

    cluster.shutdown().await;
}

// =============================================================================
// Partition failover
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leader_partition_failover() {
    let cluster = TestCluster::start(3).await;
    let old_leader = cluster.wait_for_leader(&cluster.ids()).await;
    let old_term = cluster.node(old_leader).status().term;

    for i in 1..=7u8 {
        cluster.node(old_leader).propose(vec![i]).await.unwrap();
    }
    assert!(cluster.wait_for_applied(&cluster.ids(), 7).await);

    // Entries 8..10 reach only the isolated leader and never commit.
    cluster.network.isolate(old_leader);
    let outcomes: Arc<Mutex<Vec<ReplicateResult>>> = Arc::default();
    for i in 8..=10u8 {
        let sink = Arc::clone(&outcomes);
        let index = cluster
            .node(old_leader)
            .replicate(vec![i], move |result| sink.lock().push(result))
            .unwrap();
        assert_eq!(index, i as u64);
    }

    let rest: Vec<_> = cluster.ids().into_iter().filter(|id| *id != old_leader).collect();
    let new_leader = cluster.wait_for_leader(&rest).await;
    assert!(cluster.node(new_leader).status().term > old_term);

    // Leader completeness: the new leader holds every committed entry.
    let log = cluster.log_of(new_leader);
    assert_eq!(log.iter().map(|e| e.index).collect::<Vec<_>>(), (1..=7u64).collect::<Vec<_>>());
    for (entry, i) in log.iter().zip(1..=7u8) {
        assert_eq!(entry.data_bytes(), &[i]);
    }

    let index = cluster.node(new_leader).propose(b"eleven".to_vec()).await.unwrap();
    assert_eq!(index, 8);
    assert!(cluster.wait_for_applied(&rest, 8).await);

    cluster.network.heal();
    assert!(cluster.wait_for_applied(&cluster.ids(), 8).await);

    let expected = cluster.applied_of(new_leader);
    assert_eq!(expected.last(), Some(&(8, b"eleven".to_vec())));
    for id in cluster.ids() {
        assert_eq!(cluster.applied_of(id), expected, "node {}", id);
    }

    // The orphaned proposals were truncated away and reported as failed.
    let settled = poll(CONVERGE, || {
        let outcomes = Arc::clone(&outcomes);
        async move { (outcomes.lock().len() == 3).then_some(()) }
    })
    .await;
    assert!(settled.is_some());
    assert!(outcomes.lock().iter().all(|r| !r.success && r.index == 0));

    // Log matching across every pair of nodes.
    let logs: Vec<_> = cluster.ids().into_iter().map(|id| cluster.log_of(id)).collect();
    for a in &logs {
        for b in &logs {
            assert_logs_match(a, b);
        }
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replicate_deadline_fails_call_but_entry_still_commits() {
    // Node 1 wins the first election; the others stay passive while cut off.
    let cluster = TestCluster::start_with(3, |config| {
        config.replicate_timeout = Duration::from_millis(300);
        if config.node.id != 1 {
            config.election_timeout = Duration::from_secs(30);
        }
    })
    .await;
    let leader = cluster.wait_for_leader(&cluster.ids()).await;
    assert_eq!(leader, 1);

    // Applied in time: success is reported once, the deadline never fires.
    let on_time: Arc<Mutex<Vec<ReplicateResult>>> = Arc::default();
    let sink = Arc::clone(&on_time);
    let index = cluster
        .node(leader)
        .replicate(b"on-time".to_vec(), move |result| sink.lock().push(result))
        .unwrap();
    assert!(cluster.wait_for_applied(&cluster.ids(), index).await);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(*on_time.lock(), vec![ReplicateResult::committed(index)]);

    let followers: Vec<_> = cluster.ids().into_iter().filter(|id| *id != leader).collect();
    for id in &followers {
        cluster.network.isolate(*id);
    }

    let late: Arc<Mutex<Vec<ReplicateResult>>> = Arc::default();
    let sink = Arc::clone(&late);
    let late_index = cluster
        .node(leader)
        .replicate(b"late".to_vec(), move |result| sink.lock().push(result))
        .unwrap();
    assert_eq!(late_index, index + 1);

    let expired = poll(CONVERGE, || {
        let late = Arc::clone(&late);
        async move { late.lock().first().copied() }
    })
    .await;
    assert_eq!(expired, Some(ReplicateResult { success: false, index: 0 }));
    assert!(cluster.node(leader).status().committed_index < late_index);

    // The deadline does not retract the entry.
    cluster.network.heal();
    assert!(cluster.wait_for_applied(&cluster.ids(), late_index).await);
    for id in cluster.ids() {
        assert_eq!(
            cluster.applied_of(id).last(),
            Some(&(late_index, b"late".to_vec())),
            "node {}",
            id
        );
    }
    assert_eq!(late.lock().len(), 1);

    cluster.shutdown().await;
}

// =============================================================================
// Snapshots
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lagging_follower_catches_up_from_snapshot() {
    // Small chunks so the transfer spans many InstallSnapshot calls.
    let cluster = TestCluster::start_with(3, |config| config.snapshot_chunk_size = 64).await;
    let leader = cluster.wait_for_leader(&cluster.ids()).await;
    let lagging = cluster.ids().into_iter().find(|id| *id != leader).unwrap();
    let live: Vec<_> = cluster.ids().into_iter().filter(|id| *id != lagging).collect();

    cluster.network.isolate(lagging);
    for i in 0..20u8 {
        cluster.node(leader).propose(vec![i; 16]).await.unwrap();
    }
    assert!(cluster.wait_for_applied(&live, 20).await);

    // Compact every live log so whoever leads must ship a snapshot.
    for id in &live {
        cluster.node(*id).request_snapshot().unwrap();
    }
    let (live_ref, cluster_ref) = (&live, &cluster);
    let compacted = poll(CONVERGE, || async move {
        live_ref
            .iter()
            .all(|id| cluster_ref.node(*id).status().last_snapshot_index >= 20)
            .then_some(())
    })
    .await;
    assert!(compacted.is_some());

    for i in 20..25u8 {
        cluster.node(leader).propose(vec![i; 16]).await.unwrap();
    }

    cluster.network.heal();
    assert!(cluster.wait_for_applied(&cluster.ids(), 25).await);

    let status = cluster.node(lagging).status();
    assert!(status.last_snapshot_index >= 20);
    assert!(cluster.node(lagging).with_state_machine(|sm| sm.installs) >= 1);

    let final_leader = cluster.wait_for_leader(&cluster.ids()).await;
    assert_eq!(cluster.applied_of(lagging), cluster.applied_of(final_leader));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_log_compacts_after_snapshot_distance() {
    let cluster = TestCluster::start_with(3, |config| config.snapshot.distance = 10).await;
    let leader = cluster.wait_for_leader(&cluster.ids()).await;

    for i in 0..30u8 {
        cluster.node(leader).propose(vec![i]).await.unwrap();
    }
    assert!(cluster.wait_for_applied(&cluster.ids(), 30).await);

    let cluster_ref = &cluster;
    let compacted = poll(CONVERGE, || async move {
        cluster_ref
            .ids()
            .iter()
            .all(|id| cluster_ref.node(*id).status().last_snapshot_index > 0)
            .then_some(())
    })
    .await;
    assert!(compacted.is_some());
    // Let any snapshot already under way finish.
    tokio::time::sleep(Duration::from_millis(100)).await;

    for id in cluster.ids() {
        let status = cluster.node(id).status();
        assert!(status.last_snapshot_index <= status.last_applied);
        let log = cluster.log_of(id);
        assert_eq!(log.first().map(|e| e.index), Some(status.last_snapshot_index + 1).filter(|i| *i <= 30));
    }

    cluster.shutdown().await;
}
