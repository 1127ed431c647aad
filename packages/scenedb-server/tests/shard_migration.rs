//! Integration test: subtree migration, crash recovery, and replay.
//!
//! Validates that:
//! - move_shard fans out into state transfers + attach on the destination
//!   shard and shard removes + detach on the source shard, atomically
//! - Placement follows the whole subtree and tree shape is preserved
//! - A crashed replica misses committed work, then catches up exactly via
//!   replay, including migrations folded through state transfers
//! - Replaying the full committed prefix from scratch reproduces the
//!   leader's state (recovery idempotence)

use std::collections::BTreeMap;

use scenedb::applier::Replica;
use scenedb::cluster::ClusterStore;
use scenedb::consensus::{Command, ShardLog};
use scenedb::hlc::ClockSource;
use scenedb::metrics::Metrics;
use scenedb::recovery;
use scenedb::scene::{NodeId, SceneOp};
use scenedb::txn::{TxnRecord, TxnStatus};

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

/// Cluster with 1 -> 5 -> [6, 7], the whole tree pinned to shard 0.
fn migration_cluster() -> ClusterStore {
    let mut store = ClusterStore::with_default_config().unwrap();
    store.submit(vec![add_child(None, 1)]).unwrap();
    if store.replica(0).shard_map.owner(1) != Some(0) {
        let pinned = store.move_shard(1, 0).unwrap();
        assert_eq!(pinned.status, TxnStatus::Committed);
    }
    store
        .submit(vec![
            add_child(Some(1), 5),
            add_child(Some(5), 7),
            add_child(Some(5), 6),
        ])
        .unwrap();
    store.converge().unwrap();
    store
}

/// The coordinator intent for a transaction, from any committed prefix.
fn find_intent(store: &ClusterStore, txn_id: u64) -> TxnRecord {
    for shard in 0..store.config().shards {
        for entry in store.shard_log(shard).committed_entries().unwrap() {
            if let Command::TxnIntent(record) = entry.cmd {
                if record.txn_id == txn_id {
                    return record;
                }
            }
        }
    }
    panic!("intent for txn {} not found", txn_id);
}

// ---------------------------------------------------------------------------
// Tests: Subtree Migration
// ---------------------------------------------------------------------------

#[test]
fn move_shard_fans_out_transfers_removes_detach_attach() {
    let mut store = migration_cluster();

    let outcome = store.move_shard(5, 1).unwrap();
    assert_eq!(outcome.status, TxnStatus::Committed);

    let intent = find_intent(&store, outcome.txn_id);

    // Destination shard: one state transfer per descendant, then the
    // attach that re-links the subtree root under its parent.
    let to_new: Vec<&SceneOp> = intent
        .ops
        .iter()
        .filter(|r| r.shard == 1)
        .map(|r| &r.op)
        .collect();
    let transferred: Vec<NodeId> = to_new
        .iter()
        .filter_map(|op| match op {
            SceneOp::StateTransfer { node, .. } => Some(*node),
            _ => None,
        })
        .collect();
    assert_eq!(transferred, vec![5, 6, 7]);
    assert!(
        matches!(
            to_new.last(),
            Some(SceneOp::AttachChild {
                new_parent: Some(1),
                child: 5,
                position: 0,
            })
        ),
        "attach must follow the transfers, got {:?}",
        to_new.last()
    );

    // Source shard: shard removes for the subtree, then the detach on the
    // original parent.
    let to_old: Vec<&SceneOp> = intent
        .ops
        .iter()
        .filter(|r| r.shard == 0)
        .map(|r| &r.op)
        .collect();
    let removed: Vec<NodeId> = to_old
        .iter()
        .filter_map(|op| match op {
            SceneOp::ShardRemove { node } => Some(*node),
            _ => None,
        })
        .collect();
    assert_eq!(removed, vec![5, 6, 7]);
    assert!(matches!(
        to_old.last(),
        Some(SceneOp::DetachChild { parent: 1, child: 5 })
    ));

    // Placement moved for every descendant, on every replica.
    store.converge().unwrap();
    for id in 0..store.config().replicas {
        let map = &store.replica(id).shard_map;
        for node in [5, 6, 7] {
            assert_eq!(map.owner(node), Some(1), "replica {} placement", id);
        }
        assert_eq!(map.owner(1), Some(0));
    }

    // Tree shape preserved everywhere.
    assert_eq!(store.ordered_children(1).unwrap(), vec![5]);
    assert_eq!(store.ordered_children(5).unwrap(), vec![6, 7]);
    let moved = store.get(5).unwrap();
    assert_eq!(moved.right_sibling, None);
    store.validate().unwrap();
}

#[test]
fn move_shard_rejects_partial_subtrees_and_unknown_shards() {
    let mut store = migration_cluster();

    // Unknown shard is an infrastructure error, not an abort.
    assert!(store.move_shard(5, 9).is_err());

    // Migrating to the current shard is rejected before staging.
    let same = store.move_shard(5, 0).unwrap();
    assert_eq!(same.status, TxnStatus::Aborted);

    // A subtree that spans shards cannot migrate: move 6 away first, then
    // the subtree of 5 is split between shards 0 and 1.
    let split = store.move_shard(6, 1).unwrap();
    assert_eq!(split.status, TxnStatus::Committed);
    let rejected = store.move_shard(5, 1).unwrap();
    assert_eq!(rejected.status, TxnStatus::Aborted);
    store.validate().unwrap();
}

// ---------------------------------------------------------------------------
// Tests: Crash Recovery
// ---------------------------------------------------------------------------

#[test]
fn crashed_replica_catches_up_by_replay() {
    let mut store = migration_cluster();

    store.crash(2).unwrap();

    // Commit work while replica 2 is down, including a migration so the
    // replay has to fold state transfers.
    store
        .submit(vec![SceneOp::SetProperty {
            node: 7,
            key: "material".into(),
            value: "steel".into(),
        }])
        .unwrap();
    let migrated = store.move_shard(5, 1).unwrap();
    assert_eq!(migrated.status, TxnStatus::Committed);
    store.converge().unwrap();

    assert_ne!(
        &store.replica(2).scene,
        &store.replica(0).scene,
        "crashed replica must have missed the committed work"
    );

    let report = store.recover(2).unwrap();
    assert!(report.entries_replayed > 0);
    assert!(!store.replica(2).crashed);

    assert_eq!(&store.replica(2).scene, &store.replica(0).scene);
    for shard in 0..store.config().shards {
        assert_eq!(
            store.replica(2).applied_index(shard),
            store.replica(0).applied_index(shard)
        );
        assert_eq!(
            store.replica(2).applied_index(shard),
            store.shard_log(shard).commit_index()
        );
    }
    for node in [5, 6, 7] {
        assert_eq!(store.replica(2).shard_map.owner(node), Some(1));
    }
    store.validate().unwrap();
}

#[test]
fn recovering_a_current_replica_is_a_noop() {
    let mut store = migration_cluster();
    store.converge().unwrap();

    let before = store.replica(1).scene.clone();
    let report = store.recover(1).unwrap();
    assert_eq!(report.entries_replayed, 0);
    assert_eq!(&store.replica(1).scene, &before);
}

// ---------------------------------------------------------------------------
// Tests: Replay Idempotence
// ---------------------------------------------------------------------------

#[test]
fn full_replay_from_scratch_reproduces_leader_state() {
    let mut store = migration_cluster();
    store
        .submit(vec![SceneOp::SetProperty {
            node: 6,
            key: "visible".into(),
            value: "false".into(),
        }])
        .unwrap();
    let moved = store.move_shard(5, 1).unwrap();
    assert_eq!(moved.status, TxnStatus::Committed);
    store.submit(vec![SceneOp::RemoveNode { node: 7 }]).unwrap();
    store.converge().unwrap();

    // A brand-new replica with zeroed cursors replays every committed
    // prefix through the same applier path.
    let mut fresh = Replica::new(99, store.config());
    let logs: Vec<&dyn ShardLog> = (0..store.config().shards)
        .map(|s| store.shard_log(s) as &dyn ShardLog)
        .collect();
    let clock = store.clock();
    let metrics = Metrics::new();
    recovery::recover(&mut fresh, &logs, clock.as_ref() as &dyn ClockSource, &metrics).unwrap();

    assert_eq!(&fresh.scene, &store.replica(0).scene);
    for shard in 0..store.config().shards {
        assert_eq!(
            fresh.applied_index(shard),
            store.shard_log(shard).commit_index()
        );
    }
    fresh.scene.validate().unwrap();
}
