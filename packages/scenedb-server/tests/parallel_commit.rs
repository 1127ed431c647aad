//! Integration test: parallel commit across shards.
//!
//! Validates that:
//! - A cross-shard transaction commits implicitly once every participant's
//!   entry is committed, with exactly one entry per shard
//! - An unreachable participant aborts the transaction after the
//!   `MaxLatency` window with nothing applied anywhere
//! - The conflict detector aborts a later transaction touching the subtree
//!   of a concurrent earlier-HLC transaction
//! - Committed transactions sharing a shard never carry conflicting ops

use std::collections::BTreeMap;

use scenedb::cluster::ClusterStore;
use scenedb::consensus::{Command, ShardLog};
use scenedb::hlc::HlcTimestamp;
use scenedb::scene::{NodeId, SceneOp};
use scenedb::shard::ShardId;
use scenedb::txn::coordinator::{route_ops, stage};
use scenedb::txn::{AbortReason, TxnRecord, TxnStatus};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn add_child(target: Option<NodeId>, new_node: NodeId) -> SceneOp {
    SceneOp::AddChild {
        target,
        new_node,
        properties: BTreeMap::new(),
    }
}

fn set_property(node: NodeId, key: &str, value: &str) -> SceneOp {
    SceneOp::SetProperty {
        node,
        key: key.into(),
        value: value.into(),
    }
}

/// Two-shard cluster with node 1 on one shard and node 2 migrated to the
/// other. Returns (store, shard_of_1, shard_of_2).
fn cross_shard_cluster() -> (ClusterStore, ShardId, ShardId) {
    let mut store = ClusterStore::with_default_config().unwrap();
    store
        .submit(vec![add_child(None, 1), add_child(Some(1), 2)])
        .unwrap();

    let home = store.replica(0).shard_map.owner(1).unwrap();
    let away = 1 - home;
    let outcome = store.move_shard(2, away).unwrap();
    assert_eq!(outcome.status, TxnStatus::Committed);
    assert_eq!(store.replica(0).shard_map.owner(2), Some(away));
    (store, home, away)
}

/// Count committed entries referencing `txn_id` on one shard.
fn entries_for_txn(store: &ClusterStore, shard: ShardId, txn_id: u64) -> usize {
    store
        .shard_log(shard)
        .committed_entries()
        .unwrap()
        .iter()
        .filter(|entry| match &entry.cmd {
            Command::TxnIntent(record) => record.txn_id == txn_id,
            Command::TxnCommit { txn_id: id, .. } => *id == txn_id,
            _ => false,
        })
        .count()
}

// ---------------------------------------------------------------------------
// Tests: Cross-Shard Commit
// ---------------------------------------------------------------------------

#[test]
fn cross_shard_transaction_commits_on_both_shards() {
    let (mut store, home, away) = cross_shard_cluster();

    let outcome = store
        .submit(vec![
            set_property(1, "k", "v1"),
            set_property(2, "k", "v2"),
        ])
        .unwrap();
    assert_eq!(outcome.status, TxnStatus::Committed);

    // Exactly one entry per participating shard references the txn.
    assert_eq!(entries_for_txn(&store, home, outcome.txn_id), 1);
    assert_eq!(entries_for_txn(&store, away, outcome.txn_id), 1);

    // Terminal status and both writes visible on every replica.
    store.converge().unwrap();
    for id in 0..store.config().replicas {
        let replica = store.replica(id);
        assert_eq!(
            replica.txns.status(outcome.txn_id),
            Some(TxnStatus::Committed),
            "replica {} disagrees on status",
            id
        );
        assert_eq!(
            replica.scene.get(1).unwrap().properties.get("k"),
            Some(&"v1".to_string())
        );
        assert_eq!(
            replica.scene.get(2).unwrap().properties.get("k"),
            Some(&"v2".to_string())
        );
    }
    store.validate().unwrap();
}

#[test]
fn single_shard_transaction_commits_with_one_entry() {
    let mut store = ClusterStore::with_default_config().unwrap();
    store.submit(vec![add_child(None, 1)]).unwrap();

    let outcome = store
        .submit(vec![set_property(1, "name", "root")])
        .unwrap();
    assert_eq!(outcome.status, TxnStatus::Committed);

    let shard = store.replica(0).shard_map.owner(1).unwrap();
    assert_eq!(entries_for_txn(&store, shard, outcome.txn_id), 1);
    assert_eq!(entries_for_txn(&store, 1 - shard, outcome.txn_id), 0);
}

// ---------------------------------------------------------------------------
// Tests: HLC-Window Abort
// ---------------------------------------------------------------------------

#[test]
fn unreachable_shard_aborts_after_latency_window() {
    let (mut store, _home, away) = cross_shard_cluster();

    store.shard_log(away).pause_commits();
    let outcome = store
        .submit(vec![
            set_property(1, "ka", "va"),
            set_property(2, "kb", "vb"),
        ])
        .unwrap();
    assert_eq!(outcome.status, TxnStatus::Aborted);
    assert_eq!(outcome.abort_reason, Some(AbortReason::HlcWindow));

    // Nothing applied anywhere while the shard was down.
    for id in 0..store.config().replicas {
        let replica = store.replica(id);
        assert!(replica.scene.get(1).unwrap().properties.get("ka").is_none());
    }

    // The shard coming back must not resurrect the transaction: the
    // durable abort entry beats the late commit stub.
    store.shard_log(away).resume_commits();
    store.converge().unwrap();
    for id in 0..store.config().replicas {
        let replica = store.replica(id);
        assert_ne!(
            replica.txns.status(outcome.txn_id),
            Some(TxnStatus::Committed),
            "replica {} resurrected an aborted txn",
            id
        );
        assert!(replica.scene.get(1).unwrap().properties.get("ka").is_none());
        assert!(replica.scene.get(2).unwrap().properties.get("kb").is_none());
    }
    store.validate().unwrap();
}

#[test]
fn aborted_transaction_leaves_no_created_nodes() {
    let (mut store, _home, away) = cross_shard_cluster();

    store.shard_log(away).pause_commits();
    let outcome = store
        .submit(vec![
            add_child(Some(1), 10),
            set_property(2, "touch", "x"),
        ])
        .unwrap();
    assert_eq!(outcome.status, TxnStatus::Aborted);

    store.shard_log(away).resume_commits();
    store.converge().unwrap();
    for id in 0..store.config().replicas {
        assert!(
            store.replica(id).scene.get(10).is_none(),
            "speculative node visible on replica {}",
            id
        );
    }
    store.validate().unwrap();
}

// ---------------------------------------------------------------------------
// Tests: Conflict Abort
// ---------------------------------------------------------------------------

#[test]
fn later_transaction_conflicting_with_committing_one_aborts() {
    // Tree: 1 -> [5 -> [6, 7], 3] pinned to shard 0, with node 2 on shard
    // 1 so a two-shard transaction can be held open by pausing shard 1.
    let mut store = ClusterStore::with_default_config().unwrap();
    store
        .submit(vec![add_child(None, 1), add_child(Some(1), 2)])
        .unwrap();
    if store.replica(0).shard_map.owner(1) != Some(0) {
        let pinned = store.move_shard(1, 0).unwrap();
        assert_eq!(pinned.status, TxnStatus::Committed);
    }
    let moved = store.move_shard(2, 1).unwrap();
    assert_eq!(moved.status, TxnStatus::Committed);
    store
        .submit(vec![
            add_child(Some(1), 5),
            add_child(Some(5), 7),
            add_child(Some(5), 6),
            add_child(Some(1), 3),
        ])
        .unwrap();
    store.converge().unwrap();

    // Stage a cross-shard transaction T1 = move_subtree(5, 3) + a write on
    // node 2, with shard 1 unreachable: its intent commits on shard 0 but
    // the transaction stays COMMITTING.
    let t1_id = 9001u64;
    let t1 = {
        let planner = store.replica(0);
        let routed = route_ops(
            vec![
                SceneOp::MoveSubtree {
                    node: 5,
                    new_parent: 3,
                    new_sibling: None,
                },
                set_property(2, "m", "x"),
            ],
            &planner.shard_map,
        )
        .unwrap();
        let pt = store.clock().tick();
        TxnRecord::committing(
            t1_id,
            routed.iter().map(|r| r.shard).collect(),
            HlcTimestamp::new(pt, 0),
            routed,
        )
    };
    store.shard_log(1).pause_commits();
    {
        let logs: Vec<&dyn ShardLog> = (0..store.config().shards)
            .map(|s| store.shard_log(s) as &dyn ShardLog)
            .collect();
        stage(&t1, &logs).unwrap();
    }
    store.step().unwrap();
    assert_eq!(
        store.replica(0).txns.status(t1_id),
        Some(TxnStatus::Committing),
        "T1 must still be in flight"
    );

    // T2 writes a property of node 7, which lies inside the subtree T1
    // moves; T2's HLC is later, so T2 is the one that must abort.
    let outcome = store.submit(vec![set_property(7, "k", "v")]).unwrap();
    assert_eq!(outcome.status, TxnStatus::Aborted);
    assert_eq!(outcome.abort_reason, Some(AbortReason::Conflict));

    // A write outside the contested subtree sails through.
    let ok = store.submit(vec![set_property(3, "k", "v")]).unwrap();
    assert_eq!(ok.status, TxnStatus::Committed);

    // Once the held shard returns, T1 commits and applies.
    store.shard_log(1).resume_commits();
    store.converge().unwrap();
    assert_eq!(
        store.replica(0).txns.status(t1_id),
        Some(TxnStatus::Committed)
    );
    assert_eq!(store.ordered_children(3).unwrap(), vec![5]);
    store.validate().unwrap();
}

#[test]
fn committed_transactions_sharing_a_shard_never_conflict() {
    let (mut store, _home, _away) = cross_shard_cluster();

    let a = store
        .submit(vec![set_property(1, "k", "v1"), set_property(2, "k", "v2")])
        .unwrap();
    let b = store
        .submit(vec![set_property(1, "k", "v3"), set_property(2, "j", "w")])
        .unwrap();
    assert_eq!(a.status, TxnStatus::Committed);
    // b is causally after a (the coordinator had applied a before assigning
    // b's HLC), so the same-property write does not count as concurrent.
    assert_eq!(b.status, TxnStatus::Committed);
    assert!(a.hlc < b.hlc, "commit order must match HLC order");

    let n1 = store.get(1).unwrap();
    assert_eq!(n1.properties.get("k"), Some(&"v3".to_string()));
    store.validate().unwrap();
}
