//! Per-(replica, shard) applier loop.
//!
//! Each replica advances one cursor per hosted shard, applying newly
//! committed entries exactly once. Plain scene operations mutate the tree
//! directly; transaction entries feed the pending table and trigger
//! parallel-commit resolution; migration primitives rewrite placement
//! metadata on every replica and scene state on the replicas that host the
//! affected shards.

use tracing::{debug, warn};

use crate::config::ClusterConfig;
use crate::consensus::{Command, ReplicaId, ShardLog};
use crate::error::{Result, SceneError};
use crate::hlc::{ClockSource, HlcClock};
use crate::metrics::Metrics;
use crate::scene::{SceneOp, SceneState};
use crate::shard::{ShardId, ShardMap};
use crate::txn::coordinator::{check_parallel_commit, Decision};
use crate::txn::{RoutedOp, TxnId, TxnRecord, TxnStatus, TxnTable};

/// One replica's volatile and replicated state.
#[derive(Debug)]
pub struct Replica {
    pub id: ReplicaId,
    /// Shards this replica hosts (all of them in the reference
    /// configuration).
    pub hosted: Vec<ShardId>,
    pub scene: SceneState,
    pub shard_map: ShardMap,
    pub txns: TxnTable,
    /// Applied-index cursor per shard, indexed by shard id.
    pub applied: Vec<u64>,
    pub hlc: HlcClock,
    pub crashed: bool,
    max_latency: u64,
}

impl Replica {
    pub fn new(id: ReplicaId, config: &ClusterConfig) -> Self {
        Self {
            id,
            hosted: (0..config.shards).collect(),
            scene: SceneState::new(config.max_node_id),
            shard_map: ShardMap::new(config.shards),
            txns: TxnTable::new(),
            applied: vec![0; config.shards as usize],
            hlc: HlcClock::new(),
            crashed: false,
            max_latency: config.max_latency,
        }
    }

    pub fn applied_index(&self, shard: ShardId) -> u64 {
        self.applied[shard as usize]
    }
}

/// Advance the applier for one (replica, shard) pair over every newly
/// committed entry. Returns how many entries were applied.
pub fn drain(
    replica: &mut Replica,
    shard: ShardId,
    logs: &[&dyn ShardLog],
    clock: &dyn ClockSource,
    metrics: &Metrics,
) -> Result<usize> {
    let log = logs
        .get(shard as usize)
        .ok_or(SceneError::UnknownShard(shard))?;
    let mut applied = 0usize;
    while replica.applied[shard as usize] < log.commit_index() {
        let index = replica.applied[shard as usize] + 1;
        let entry = log.entry(index)?;

        // Join the entry's timestamp before acting on it, so the local
        // clock never falls behind anything it has observed.
        replica.hlc.observe(clock.now_pt(), entry.hlc);

        match &entry.cmd {
            Command::Scene(op) => {
                apply_routed_op(
                    replica,
                    &RoutedOp {
                        shard: entry.shard,
                        op: op.clone(),
                    },
                )?;
            }
            Command::TxnIntent(record) => {
                replica.txns.observe(record);
                try_resolve(replica, record.txn_id, logs)?;
            }
            Command::TxnCommit { txn_id, .. } => {
                try_resolve(replica, *txn_id, logs)?;
            }
            Command::TxnAbort { txn_id } => {
                if replica.txns.transition(*txn_id, TxnStatus::Aborted) {
                    debug!(replica = replica.id, txn_id, "transaction aborted");
                }
            }
        }

        replica.applied[shard as usize] = index;
        applied += 1;
        metrics.record_entry_applied();
    }
    Ok(applied)
}

/// Resolve a committing transaction if the committed prefixes now decide
/// it. Expired windows are left for the coordinator to make durable.
fn try_resolve(replica: &mut Replica, txn_id: TxnId, logs: &[&dyn ShardLog]) -> Result<()> {
    if replica.txns.get(txn_id).is_none() {
        match lookup_intent(txn_id, logs)? {
            Some(record) => replica.txns.observe(&record),
            None => return Ok(()),
        }
    }
    let record = replica.txns.get(txn_id).cloned().ok_or(SceneError::TxnNotFound(txn_id))?;
    if record.status != TxnStatus::Committing {
        return Ok(());
    }
    match check_parallel_commit(&record, logs, replica.hlc.last(), replica.max_latency)? {
        Decision::Commit => {
            if replica.txns.transition(txn_id, TxnStatus::Committed) {
                debug!(replica = replica.id, txn_id, "transaction committed");
                apply_txn_ops(replica, &record)?;
            }
        }
        Decision::Abort => {
            replica.txns.transition(txn_id, TxnStatus::Aborted);
        }
        Decision::Expired | Decision::Wait => {}
    }
    Ok(())
}

/// Find the coordinator intent for a transaction in any committed prefix.
fn lookup_intent(txn_id: TxnId, logs: &[&dyn ShardLog]) -> Result<Option<TxnRecord>> {
    for log in logs {
        for entry in log.committed_entries()? {
            if let Command::TxnIntent(record) = entry.cmd {
                if record.txn_id == txn_id {
                    return Ok(Some(record));
                }
            }
        }
    }
    Ok(None)
}

/// Apply a committed transaction's operations, in op order, exactly once
/// per replica (guarded by the status transition in the caller).
fn apply_txn_ops(replica: &mut Replica, record: &TxnRecord) -> Result<()> {
    for routed in &record.ops {
        apply_routed_op(replica, routed)?;
    }
    Ok(())
}

/// Apply one routed operation: placement metadata on every replica, scene
/// mutation only where the carrying shard is hosted.
fn apply_routed_op(replica: &mut Replica, routed: &RoutedOp) -> Result<()> {
    // Placement metadata is global: every replica tracks where nodes live,
    // whether or not it hosts them.
    record_placement(&mut replica.shard_map, routed);

    if !replica.hosted.contains(&routed.shard) {
        return Ok(());
    }

    if let SceneOp::ShardRemove { node } = &routed.op {
        // The record must survive locally when this replica also hosts the
        // node's destination shard.
        let keep = replica
            .shard_map
            .owner(*node)
            .is_some_and(|owner| replica.hosted.contains(&owner));
        if keep {
            return Ok(());
        }
    }

    match replica.scene.apply(&routed.op) {
        Ok(()) => {
            if let SceneOp::RemoveNode { node } = &routed.op {
                // The subtree is gone; drop its placement entries. The
                // descendant set was deleted already, so sweep the map by
                // scene membership.
                replica.shard_map.remove(*node);
                let stale: Vec<_> = replica
                    .shard_map
                    .nodes_on(routed.shard)
                    .into_iter()
                    .filter(|&n| !replica.scene.contains(n))
                    .collect();
                for n in stale {
                    replica.shard_map.remove(n);
                }
            }
            Ok(())
        }
        Err(err) if err.is_rejection() => {
            // Deterministic skip: the op references nodes this replica does
            // not host, or was validated away before staging.
            warn!(
                replica = replica.id,
                shard = routed.shard,
                error = %err,
                "skipping unapplicable committed op"
            );
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Global placement side effects of an operation.
fn record_placement(shard_map: &mut ShardMap, routed: &RoutedOp) {
    match &routed.op {
        SceneOp::AddChild { new_node, .. } | SceneOp::AddSibling { new_node, .. } => {
            shard_map.assign(*new_node, routed.shard);
        }
        SceneOp::StateTransfer { node, .. } => {
            shard_map.migrate(*node, routed.shard);
        }
        SceneOp::BatchStructure { structure_ops } => {
            for nested in structure_ops {
                record_placement(
                    shard_map,
                    &RoutedOp {
                        shard: routed.shard,
                        op: nested.clone(),
                    },
                );
            }
        }
        _ => {}
    }
}
