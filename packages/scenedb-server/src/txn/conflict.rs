//! Conflict detection for parallel commit.
//!
//! Pure and deterministic over a snapshot of the committed prefixes and the
//! scene tree: a candidate transaction must abort when any of its operations
//! conflicts with an operation drawn from a committed entry whose HLC
//! strictly precedes the candidate's. Batches count as the set of their
//! contained operations; `TxnCommit` stubs count via the ops of the
//! referenced transaction unless that transaction's terminal status is
//! `Aborted` (its ops were never applied).

use std::collections::HashSet;

use tracing::trace;

use crate::consensus::{Command, ShardLog};
use crate::error::Result;
use crate::scene::{NodeId, SceneOp, SceneState};
use crate::txn::{TxnId, TxnRecord, TxnStatus, TxnTable};

/// Flatten batches into the atomic operations they carry.
fn atomic_ops(op: &SceneOp) -> Vec<SceneOp> {
    match op {
        SceneOp::BatchUpdate { updates } => updates
            .iter()
            .map(|u| SceneOp::SetProperty {
                node: u.node,
                key: u.key.clone(),
                value: u.value.clone(),
            })
            .collect(),
        SceneOp::BatchStructure { structure_ops } => {
            structure_ops.iter().flat_map(atomic_ops).collect()
        }
        other => vec![other.clone()],
    }
}

/// The node whose subtree a mutation reshapes, for the closure rule.
/// Migration primitives count as tree mutations of their subject node.
fn mutation_node(op: &SceneOp) -> Option<NodeId> {
    match op {
        SceneOp::MoveSubtree { node, .. } => Some(*node),
        SceneOp::RemoveNode { node } => Some(*node),
        SceneOp::MoveChild { parent, .. } => Some(*parent),
        SceneOp::StateTransfer { node, .. } => Some(*node),
        SceneOp::ShardRemove { node } => Some(*node),
        SceneOp::DetachChild { child, .. } => Some(*child),
        SceneOp::AttachChild { child, .. } => Some(*child),
        _ => None,
    }
}

/// Descendant closure of `node`, falling back to the node itself when it is
/// no longer (or not yet) present in the snapshot.
fn closure(scene: &SceneState, node: NodeId) -> Vec<NodeId> {
    let descendants = scene.descendants(node);
    if descendants.is_empty() {
        vec![node]
    } else {
        descendants
    }
}

/// Whether two operations conflict. Symmetric; batches conflict when any
/// of their contained operations do.
pub fn ops_conflict(a: &SceneOp, b: &SceneOp, scene: &SceneState) -> bool {
    let left = atomic_ops(a);
    let right = atomic_ops(b);
    left.iter()
        .any(|x| right.iter().any(|y| atomic_conflict(x, y, scene)))
}

fn atomic_conflict(a: &SceneOp, b: &SceneOp, scene: &SceneState) -> bool {
    // Rule 1: same property of the same node.
    if let (
        SceneOp::SetProperty {
            node: n1, key: k1, ..
        },
        SceneOp::SetProperty {
            node: n2, key: k2, ..
        },
    ) = (a, b)
    {
        if n1 == n2 && k1 == k2 {
            return true;
        }
    }

    // Rule 2: one is a tree mutation and the other touches its subtree.
    for (mutation, other) in [(a, b), (b, a)] {
        if let Some(node) = mutation_node(mutation) {
            if let Some(touched) = other.primary_node() {
                if closure(scene, node).contains(&touched) {
                    return true;
                }
            }
        }
    }

    // Rule 3: both reposition the same child under the same parent.
    if let (
        SceneOp::MoveChild {
            parent: p1,
            child_node: c1,
            ..
        },
        SceneOp::MoveChild {
            parent: p2,
            child_node: c2,
            ..
        },
    ) = (a, b)
    {
        if p1 == p2 && c1 == c2 {
            return true;
        }
    }

    // Rule 4: a reorder under P against an insertion targeting P.
    for (x, y) in [(a, b), (b, a)] {
        if let SceneOp::MoveChild { parent, .. } = x {
            match y {
                SceneOp::AddChild {
                    target: Some(t), ..
                }
                | SceneOp::AddSibling { target: t, .. } => {
                    if t == parent {
                        return true;
                    }
                }
                _ => {}
            }
        }
    }

    false
}

/// Whether any operation of `txn` conflicts with a committed entry whose
/// HLC strictly precedes `txn.hlc`, over every shard's log.
///
/// `settled_below` holds, per shard, the commit index the coordinator had
/// already converged past when it assigned `txn.hlc`. Entries at or below
/// that index belonging to resolved work are *settled*: the candidate was
/// timestamped after observing their effects, so applying it later cannot
/// reorder a conflicting pair. What must abort the candidate is the
/// genuinely concurrent remainder - entries of transactions still
/// committing, and entries that committed with an earlier HLC after the
/// snapshot was taken (the cross-shard race parallel commit exists to
/// catch).
pub fn txn_conflicts_with_committed(
    txn: &TxnRecord,
    logs: &[&dyn ShardLog],
    table: &TxnTable,
    scene: &SceneState,
    settled_below: &[u64],
) -> Result<bool> {
    let candidate: Vec<SceneOp> = txn.ops.iter().flat_map(|r| atomic_ops(&r.op)).collect();

    // Durable aborts survive pending-table garbage collection; collect them
    // from the logs so an old aborted transaction never counts.
    let mut aborted: HashSet<TxnId> = HashSet::new();
    for log in logs {
        for entry in log.committed_entries()? {
            if let Command::TxnAbort { txn_id } = entry.cmd {
                aborted.insert(txn_id);
            }
        }
    }

    for log in logs {
        let snapshot = settled_below
            .get(log.shard() as usize)
            .copied()
            .unwrap_or(0);
        for (offset, entry) in log.committed_entries()?.into_iter().enumerate() {
            if entry.hlc >= txn.hlc {
                continue;
            }
            let within_snapshot = (offset as u64 + 1) <= snapshot;
            let committed_ops: Vec<SceneOp> = match &entry.cmd {
                Command::Scene(op) => {
                    if within_snapshot {
                        continue;
                    }
                    atomic_ops(op)
                }
                Command::TxnIntent(record) => {
                    if record.txn_id == txn.txn_id
                        || is_aborted(record.txn_id, table, &aborted)
                        || (within_snapshot && !is_committing(record.txn_id, table))
                    {
                        continue;
                    }
                    record.ops.iter().flat_map(|r| atomic_ops(&r.op)).collect()
                }
                Command::TxnCommit { txn_id, .. } => {
                    if *txn_id == txn.txn_id
                        || is_aborted(*txn_id, table, &aborted)
                        || (within_snapshot && !is_committing(*txn_id, table))
                    {
                        continue;
                    }
                    match resolve_ops(*txn_id, table, logs)? {
                        Some(ops) => ops,
                        None => continue,
                    }
                }
                Command::TxnAbort { .. } => continue,
            };
            for mine in &candidate {
                for theirs in &committed_ops {
                    if atomic_conflict(mine, theirs, scene) {
                        trace!(
                            txn_id = txn.txn_id,
                            shard = log.shard(),
                            "conflict against earlier committed entry"
                        );
                        return Ok(true);
                    }
                }
            }
        }
    }
    Ok(false)
}

/// Whether the local table still records the transaction as committing.
/// A missing record under the snapshot means the record was resolved and
/// garbage-collected: the pending table never collects committing entries.
fn is_committing(txn_id: TxnId, table: &TxnTable) -> bool {
    table.status(txn_id) == Some(TxnStatus::Committing)
}

fn is_aborted(txn_id: TxnId, table: &TxnTable, durable_aborts: &HashSet<TxnId>) -> bool {
    durable_aborts.contains(&txn_id) || table.status(txn_id) == Some(TxnStatus::Aborted)
}

/// Ops of a referenced transaction: the pending table first, falling back
/// to the coordinator intent entry in the committed logs (the table may
/// have been garbage-collected).
fn resolve_ops(
    txn_id: TxnId,
    table: &TxnTable,
    logs: &[&dyn ShardLog],
) -> Result<Option<Vec<SceneOp>>> {
    if let Some(record) = table.get(txn_id) {
        return Ok(Some(
            record.ops.iter().flat_map(|r| atomic_ops(&r.op)).collect(),
        ));
    }
    for log in logs {
        for entry in log.committed_entries()? {
            match &entry.cmd {
                Command::TxnIntent(record) if record.txn_id == txn_id => {
                    return Ok(Some(
                        record.ops.iter().flat_map(|r| atomic_ops(&r.op)).collect(),
                    ));
                }
                Command::TxnAbort { txn_id: aborted } if *aborted == txn_id => {
                    return Ok(None);
                }
                _ => {}
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn set_prop(node: NodeId, key: &str) -> SceneOp {
        SceneOp::SetProperty {
            node,
            key: key.into(),
            value: "v".into(),
        }
    }

    fn tree() -> SceneState {
        let mut state = SceneState::new(100);
        for (target, new_node) in [(None, 1), (Some(1), 5), (Some(5), 6), (Some(5), 7)] {
            state
                .apply(&SceneOp::AddChild {
                    target,
                    new_node,
                    properties: BTreeMap::new(),
                })
                .unwrap();
        }
        state
    }

    #[test]
    fn test_same_property_conflicts() {
        let scene = tree();
        assert!(ops_conflict(&set_prop(5, "k"), &set_prop(5, "k"), &scene));
        assert!(!ops_conflict(&set_prop(5, "k"), &set_prop(5, "other"), &scene));
        assert!(!ops_conflict(&set_prop(5, "k"), &set_prop(1, "k"), &scene));
    }

    #[test]
    fn test_tree_mutation_conflicts_with_descendant_write() {
        let scene = tree();
        let mv = SceneOp::MoveSubtree {
            node: 5,
            new_parent: 1,
            new_sibling: None,
        };
        // 7 is inside the subtree of 5, 1 is not.
        assert!(ops_conflict(&mv, &set_prop(7, "k"), &scene));
        assert!(ops_conflict(&set_prop(7, "k"), &mv, &scene));
        assert!(!ops_conflict(&mv, &set_prop(1, "k"), &scene));
    }

    #[test]
    fn test_move_child_same_pair_conflicts() {
        let scene = tree();
        let a = SceneOp::MoveChild {
            parent: 5,
            child_node: 6,
            to_index: 0,
        };
        let b = SceneOp::MoveChild {
            parent: 5,
            child_node: 6,
            to_index: 1,
        };
        assert!(ops_conflict(&a, &b, &scene));
    }

    #[test]
    fn test_move_child_vs_insertion_under_same_parent() {
        let scene = tree();
        let reorder = SceneOp::MoveChild {
            parent: 5,
            child_node: 6,
            to_index: 0,
        };
        let insert = SceneOp::AddChild {
            target: Some(5),
            new_node: 9,
            properties: BTreeMap::new(),
        };
        assert!(ops_conflict(&reorder, &insert, &scene));
        assert!(ops_conflict(&insert, &reorder, &scene));
    }

    #[test]
    fn test_batches_flatten_for_detection() {
        let scene = tree();
        let batch = SceneOp::BatchUpdate {
            updates: vec![crate::scene::PropertyUpdate {
                node: 7,
                key: "k".into(),
                value: "x".into(),
            }],
        };
        assert!(ops_conflict(&batch, &set_prop(7, "k"), &scene));
    }
}
