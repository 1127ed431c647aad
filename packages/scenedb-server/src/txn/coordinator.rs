//! Parallel-commit coordination.
//!
//! The coordinator stages a transaction by appending the full intent to the
//! coordinator shard's log and a commit stub to every other participant,
//! then watches the committed prefixes: the transaction is implicitly
//! committed once every participant has its matching entry at or below the
//! commit index, with no second round trip. A durable `TxnAbort` entry
//! anywhere is binding and beats a later commit observation, which keeps
//! replicas that evaluate at different times in agreement.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::consensus::{Command, LogEntry, ShardLog};
use crate::error::{Result, SceneError};
use crate::hlc::HlcTimestamp;
use crate::scene::{NodeId, SceneOp, SceneState};
use crate::shard::{ShardId, ShardMap};
use crate::txn::{AbortReason, RoutedOp, TxnRecord, TxnStatus};

/// Bounded retries when chasing a moving leader.
const MAX_APPEND_RETRIES: usize = 3;

/// Client-visible result of a submitted transaction.
#[derive(Debug, Clone, Serialize)]
pub struct TxnOutcome {
    pub txn_id: u64,
    pub status: TxnStatus,
    pub hlc: HlcTimestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<AbortReason>,
}

/// Verdict of one `check_parallel_commit` evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Every participant has its entry committed and no abort is on record.
    Commit,
    /// A durable abort entry exists.
    Abort,
    /// The HLC window has lapsed. Only the coordinator turns this into a
    /// durable abort; other replicas keep waiting for the entries.
    Expired,
    /// Still unresolved.
    Wait,
}

/// Assign every operation to the shard hosting its primary node. Fresh
/// roots get the deterministic default placement. Nodes created earlier in
/// the same transaction are visible to later operations through a pending
/// placement overlay.
pub fn route_ops(ops: Vec<SceneOp>, shard_map: &ShardMap) -> Result<Vec<RoutedOp>> {
    fn known(
        pending: &HashMap<NodeId, ShardId>,
        shard_map: &ShardMap,
        node: NodeId,
    ) -> Option<ShardId> {
        pending.get(&node).copied().or_else(|| shard_map.owner(node))
    }

    let mut pending: HashMap<NodeId, ShardId> = HashMap::new();
    let mut routed = Vec::with_capacity(ops.len());
    for op in ops {
        let Some(primary) = op.primary_node() else {
            // An empty batch routes anywhere; pick shard 0.
            routed.push(RoutedOp { shard: 0, op });
            continue;
        };
        let shard = match &op {
            SceneOp::AddChild {
                target: None,
                new_node,
                ..
            } => {
                let shard = known(&pending, shard_map, *new_node)
                    .unwrap_or_else(|| shard_map.default_shard(*new_node));
                pending.insert(*new_node, shard);
                shard
            }
            SceneOp::AddChild {
                target: Some(target),
                new_node,
                ..
            } => {
                let shard = known(&pending, shard_map, *target)
                    .ok_or(SceneError::NodeNotFound(*target))?;
                pending.insert(*new_node, shard);
                shard
            }
            SceneOp::AddSibling {
                target, new_node, ..
            } => {
                let shard = known(&pending, shard_map, *target)
                    .ok_or(SceneError::NodeNotFound(*target))?;
                pending.insert(*new_node, shard);
                shard
            }
            _ => {
                let shard = known(&pending, shard_map, primary)
                    .ok_or(SceneError::NodeNotFound(primary))?;
                // Creations nested in a structural batch land on the
                // batch's shard.
                if let SceneOp::BatchStructure { structure_ops } = &op {
                    record_batch_creations(structure_ops, shard, &mut pending);
                }
                shard
            }
        };
        routed.push(RoutedOp { shard, op });
    }
    Ok(routed)
}

fn record_batch_creations(
    ops: &[SceneOp],
    shard: ShardId,
    pending: &mut HashMap<NodeId, ShardId>,
) {
    for op in ops {
        match op {
            SceneOp::AddChild { new_node, .. } | SceneOp::AddSibling { new_node, .. } => {
                pending.insert(*new_node, shard);
            }
            SceneOp::BatchStructure { structure_ops } => {
                record_batch_creations(structure_ops, shard, pending);
            }
            _ => {}
        }
    }
}

/// Append an entry through the current leader of a shard, retrying a
/// bounded number of times when the leadership moves underneath us.
pub fn append_via_leader(log: &dyn ShardLog, entry: LogEntry) -> Result<u64> {
    let mut last_known = log.current_leader();
    for _ in 0..MAX_APPEND_RETRIES {
        let Some(leader) = last_known else {
            return Err(SceneError::NoLeader(log.shard()));
        };
        match log.append(leader, entry.clone()) {
            Ok(index) => return Ok(index),
            Err(SceneError::NotLeader { leader: current, .. }) => {
                debug!(shard = log.shard(), current, "leader moved; retrying append");
                last_known = Some(current);
            }
            Err(err) => return Err(err),
        }
    }
    Err(SceneError::NoLeader(log.shard()))
}

/// Stage a committing transaction: full intent on the coordinator shard,
/// commit stubs everywhere else. Entries carry the transaction's HLC.
pub fn stage(txn: &TxnRecord, logs: &[&dyn ShardLog]) -> Result<()> {
    debug_assert_eq!(txn.status, TxnStatus::Committing);
    for &shard in &txn.shards {
        let log = logs
            .get(shard as usize)
            .ok_or(SceneError::UnknownShard(shard))?;
        let cmd = if shard == txn.coord_shard {
            Command::TxnIntent(txn.clone())
        } else {
            Command::TxnCommit {
                txn_id: txn.txn_id,
                hlc: txn.hlc,
            }
        };
        append_via_leader(
            *log,
            LogEntry {
                term: 0,
                shard,
                hlc: txn.hlc,
                cmd,
            },
        )?;
    }
    Ok(())
}

/// Make an abort durable on every participating shard. Best-effort per
/// shard: a shard with no reachable leader simply learns later; the abort
/// is already binding once any participant carries it.
pub fn stage_abort(txn: &TxnRecord, logs: &[&dyn ShardLog], hlc: HlcTimestamp) {
    for &shard in &txn.shards {
        let Some(log) = logs.get(shard as usize) else {
            continue;
        };
        let entry = LogEntry {
            term: 0,
            shard,
            hlc,
            cmd: Command::TxnAbort { txn_id: txn.txn_id },
        };
        if let Err(err) = append_via_leader(*log, entry) {
            warn!(
                txn_id = txn.txn_id,
                shard,
                error = %err,
                "could not record abort on shard"
            );
        }
    }
}

/// Evaluate the parallel-commit state of a transaction against the
/// committed prefixes. `logs` is indexed by shard id.
pub fn check_parallel_commit(
    txn: &TxnRecord,
    logs: &[&dyn ShardLog],
    local_hlc: HlcTimestamp,
    max_latency: u64,
) -> Result<Decision> {
    // A durable abort is binding regardless of what else committed.
    for &shard in &txn.shards {
        let log = logs
            .get(shard as usize)
            .ok_or(SceneError::UnknownShard(shard))?;
        for entry in log.committed_entries()? {
            if matches!(entry.cmd, Command::TxnAbort { txn_id } if txn_id == txn.txn_id) {
                return Ok(Decision::Abort);
            }
        }
    }

    // Implicit commit: every participant carries its intent or stub at or
    // below the commit index.
    let mut all_present = true;
    for &shard in &txn.shards {
        let log = logs
            .get(shard as usize)
            .ok_or(SceneError::UnknownShard(shard))?;
        let present = log.committed_entries()?.iter().any(|entry| match &entry.cmd {
            Command::TxnIntent(record) => record.txn_id == txn.txn_id,
            Command::TxnCommit { txn_id, .. } => *txn_id == txn.txn_id,
            _ => false,
        });
        if !present {
            all_present = false;
            break;
        }
    }
    if all_present {
        return Ok(Decision::Commit);
    }

    if local_hlc.diff(txn.hlc) > max_latency {
        return Ok(Decision::Expired);
    }
    Ok(Decision::Wait)
}

/// Decompose `move_shard{node, new_shard}` into the migration fan-out:
/// state transfers and an attach on the destination shard, shard removes on
/// the source shard, and a detach on the original parent's shard. All ride
/// one transaction so a partially-migrated subtree can never become
/// visible.
pub fn synthesize_move_shard(
    scene: &SceneState,
    shard_map: &ShardMap,
    node: NodeId,
    new_shard: ShardId,
) -> Result<Vec<RoutedOp>> {
    if new_shard >= shard_map.shard_count() {
        return Err(SceneError::UnknownShard(new_shard));
    }
    if !scene.contains(node) {
        return Err(SceneError::NodeNotFound(node));
    }
    let old_shard = shard_map
        .owner(node)
        .ok_or(SceneError::NodeNotFound(node))?;
    if old_shard == new_shard {
        return Err(SceneError::RejectedOp(format!(
            "node {} already lives on shard {}",
            node, new_shard
        )));
    }

    let subtree = scene.descendants(node);
    for &member in &subtree {
        if shard_map.owner(member) != Some(old_shard) {
            return Err(SceneError::RejectedOp(format!(
                "subtree of {} is not fully contained on shard {}",
                node, old_shard
            )));
        }
    }

    let mut ops = Vec::with_capacity(subtree.len() * 2 + 2);
    for &member in &subtree {
        let state = scene
            .get(member)
            .ok_or(SceneError::NodeNotFound(member))?
            .clone();
        ops.push(RoutedOp {
            shard: new_shard,
            op: SceneOp::StateTransfer {
                node: member,
                state,
            },
        });
    }
    for &member in &subtree {
        ops.push(RoutedOp {
            shard: old_shard,
            op: SceneOp::ShardRemove { node: member },
        });
    }
    match scene.parent_of(node) {
        Some((parent, position)) => {
            let parent_shard = shard_map
                .owner(parent)
                .ok_or(SceneError::NodeNotFound(parent))?;
            ops.push(RoutedOp {
                shard: parent_shard,
                op: SceneOp::DetachChild {
                    parent,
                    child: node,
                },
            });
            ops.push(RoutedOp {
                shard: new_shard,
                op: SceneOp::AttachChild {
                    new_parent: Some(parent),
                    child: node,
                    position: position as u32,
                },
            });
        }
        None => {
            ops.push(RoutedOp {
                shard: new_shard,
                op: SceneOp::AttachChild {
                    new_parent: None,
                    child: node,
                    position: 0,
                },
            });
        }
    }
    Ok(ops)
}
