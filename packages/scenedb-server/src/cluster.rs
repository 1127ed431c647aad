//! Cluster store: shard logs, replicas, and the client-facing operations.
//!
//! Wraps N per-shard consensus logs and M replicas behind one interface:
//! `submit` drives the transaction coordinator, `get`/`ordered_children`
//! read from the leader of the owning shard, `move_shard` synthesizes a
//! migration transaction, and `crash`/`recover` exercise the recovery
//! engine. A deterministic convergence loop (`step` until quiescent) stands
//! in for the per-shard applier threads: every call drains each live
//! replica's appliers in a fixed order, so a whole cluster is reproducible
//! from its inputs.
//!
//! NOT Send+Sync by default. For multi-threaded access, wrap in
//! `Arc<Mutex<ClusterStore>>` (the server binary does).

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info};

use crate::applier::{self, Replica};
use crate::config::ClusterConfig;
use crate::consensus::{Command, LogEntry, LocalLog, ReplicaId, ShardLog};
use crate::error::{Result, SceneError};
use crate::hlc::{ClockSource, TickClock};
use crate::metrics::Metrics;
use crate::recovery::{self, RecoveryReport};
use crate::scene::{NodeId, SceneOp};
use crate::shard::ShardId;
use crate::txn::conflict::txn_conflicts_with_committed;
use crate::txn::coordinator::{
    self, check_parallel_commit, route_ops, synthesize_move_shard, Decision, TxnOutcome,
};
use crate::txn::{AbortReason, RoutedOp, TxnRecord, TxnStatus};

/// Client view of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeView {
    pub left_child: Option<NodeId>,
    pub right_sibling: Option<NodeId>,
    pub properties: BTreeMap<String, String>,
}

/// The whole deterministic cluster: per-shard logs plus replicas.
pub struct ClusterStore {
    config: ClusterConfig,
    clock: Arc<TickClock>,
    logs: Vec<Arc<LocalLog>>,
    replicas: Vec<Replica>,
    metrics: Arc<Metrics>,
    next_txn_id: u64,
}

impl ClusterStore {
    pub fn new(config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        let logs = (0..config.shards)
            .map(|shard| Arc::new(LocalLog::new(shard, 0)))
            .collect();
        let replicas = (0..config.replicas)
            .map(|id| Replica::new(id, &config))
            .collect();
        Ok(Self {
            config,
            clock: Arc::new(TickClock::new()),
            logs,
            replicas,
            metrics: Arc::new(Metrics::new()),
            next_txn_id: 1,
        })
    }

    pub fn with_default_config() -> Result<Self> {
        Self::new(ClusterConfig::default())
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn clock(&self) -> Arc<TickClock> {
        Arc::clone(&self.clock)
    }

    /// Read access for tests and the recovery engine.
    pub fn replica(&self, id: ReplicaId) -> &Replica {
        &self.replicas[id]
    }

    pub fn shard_log(&self, shard: ShardId) -> &LocalLog {
        &self.logs[shard as usize]
    }

    /// Leader-change notification from the (external) election layer.
    pub fn set_leader(&self, shard: ShardId, leader: Option<ReplicaId>) {
        self.logs[shard as usize].set_leader(leader);
    }

    fn dyn_logs(logs: &[Arc<LocalLog>]) -> Vec<&dyn ShardLog> {
        logs.iter().map(|l| l.as_ref() as &dyn ShardLog).collect()
    }

    fn first_live(&self) -> Result<&Replica> {
        self.replicas
            .iter()
            .find(|r| !r.crashed)
            .ok_or(SceneError::NoLeader(0))
    }

    // ── Applier driving ────────────────────────────────────────────────

    /// Drain every live replica's appliers once. Returns entries applied.
    /// A replica that trips an invariant violation halts (is marked
    /// crashed) instead of diverging.
    pub fn step(&mut self) -> Result<usize> {
        let logs = Self::dyn_logs(&self.logs);
        let mut total = 0usize;
        for replica in self.replicas.iter_mut() {
            if replica.crashed {
                continue;
            }
            for shard in 0..self.config.shards {
                match applier::drain(replica, shard, &logs, self.clock.as_ref(), &self.metrics) {
                    Ok(applied) => total += applied,
                    Err(SceneError::InvariantViolation(msg)) => {
                        error!(replica = replica.id, %msg, "replica halted on invariant violation");
                        replica.crashed = true;
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(total)
    }

    /// Step until no replica makes progress.
    pub fn converge(&mut self) -> Result<()> {
        while self.step()? > 0 {}
        Ok(())
    }

    // ── Bootstrap ──────────────────────────────────────────────────────

    /// Load an initial tree through plain scene-op entries, one per log
    /// append, converging after each so placement follows the growing tree.
    /// If exactly one node exists afterwards it is replicated across all
    /// shards (single-node convention).
    pub fn bootstrap(&mut self, ops: &[SceneOp]) -> Result<()> {
        for op in ops {
            let routed = {
                let planner = self.first_live()?;
                route_ops(vec![op.clone()], &planner.shard_map)?
            };
            for RoutedOp { shard, op } in routed {
                let log = &self.logs[shard as usize];
                let leader = log
                    .current_leader()
                    .ok_or(SceneError::NoLeader(shard))?;
                let pt = self.clock.tick();
                let hlc = self.replicas[leader].hlc.tick(pt);
                coordinator::append_via_leader(
                    log.as_ref(),
                    LogEntry {
                        term: 0,
                        shard,
                        hlc,
                        cmd: Command::Scene(op),
                    },
                )?;
            }
            self.converge()?;
        }

        let live: Vec<NodeId> = {
            let planner = self.first_live()?;
            planner.scene.live_nodes().collect()
        };
        if let [only] = live[..] {
            for replica in self.replicas.iter_mut() {
                replica.shard_map.assign_all(only);
            }
        }
        Ok(())
    }

    // ── Transactions ───────────────────────────────────────────────────

    /// Submit a transaction of client operations. Blocks (deterministically
    /// stepping appliers and the tick clock) until the transaction reaches
    /// a terminal status.
    pub fn submit(&mut self, ops: Vec<SceneOp>) -> Result<TxnOutcome> {
        if let Some(internal) = ops.iter().find(|op| !op.is_client_op()) {
            return Err(SceneError::RejectedOp(format!(
                "migration primitive submitted directly: {:?}",
                internal
            )));
        }
        self.converge()?;
        let routed = {
            let planner = self.first_live()?;
            match route_ops(ops, &planner.shard_map) {
                Ok(routed) => routed,
                Err(err) if err.is_rejection() => {
                    return self.rejected_outcome();
                }
                Err(err) => return Err(err),
            }
        };
        self.run_txn(routed, false)
    }

    /// Migrate the subtree rooted at `node` to `new_shard` through one
    /// coordinator-synthesized transaction.
    pub fn move_shard(&mut self, node: NodeId, new_shard: ShardId) -> Result<TxnOutcome> {
        self.converge()?;
        let routed = {
            let planner = self.first_live()?;
            match synthesize_move_shard(&planner.scene, &planner.shard_map, node, new_shard) {
                Ok(routed) => routed,
                Err(err) if err.is_rejection() => {
                    return self.rejected_outcome();
                }
                Err(err) => return Err(err),
            }
        };
        self.run_txn(routed, true)
    }

    /// An aborted outcome for a transaction rejected before staging: no
    /// entry exists anywhere, so no durable abort is needed.
    fn rejected_outcome(&mut self) -> Result<TxnOutcome> {
        let txn_id = self.next_txn_id;
        self.next_txn_id += 1;
        self.metrics.record_abort(AbortReason::Rejected);
        Ok(TxnOutcome {
            txn_id,
            status: TxnStatus::Aborted,
            hlc: self.first_live()?.hlc.last(),
            abort_reason: Some(AbortReason::Rejected),
        })
    }

    fn run_txn(&mut self, routed: Vec<RoutedOp>, is_migration: bool) -> Result<TxnOutcome> {
        let txn_id = self.next_txn_id;
        self.next_txn_id += 1;

        let shards: Vec<ShardId> = routed.iter().map(|r| r.shard).collect();
        let coord_shard = shards.iter().copied().min().unwrap_or(0);
        let coord_leader = match self.logs[coord_shard as usize].current_leader() {
            Some(leader) if !self.replicas[leader].crashed => leader,
            _ => {
                self.metrics.record_abort(AbortReason::NoLeader);
                return Ok(TxnOutcome {
                    txn_id,
                    status: TxnStatus::Aborted,
                    hlc: self.first_live()?.hlc.last(),
                    abort_reason: Some(AbortReason::NoLeader),
                });
            }
        };

        // HLC assignment: the coordinator's leader advances its clock for
        // the append. Everything resolved and committed up to this point is
        // settled for conflict purposes; the snapshot marks the boundary.
        let pt = self.clock.tick();
        let hlc = self.replicas[coord_leader].hlc.tick(pt);
        let settled_below: Vec<u64> = self.logs.iter().map(|l| l.commit_index()).collect();
        let txn = TxnRecord::committing(txn_id, shards, hlc, routed);

        // Validation dry-run against the coordinator's current state: a
        // rejected operation aborts before anything is staged. Migration
        // primitives are synthesized from that same state and skip the
        // probe; their application is hosting-aware in the applier.
        let mut probe = self.replicas[coord_leader].scene.clone();
        for routed_op in &txn.ops {
            if !routed_op.op.is_client_op() {
                continue;
            }
            match probe.apply(&routed_op.op) {
                Ok(()) => {}
                Err(err) if err.is_rejection() => {
                    debug!(txn_id, error = %err, "transaction rejected by validation");
                    self.metrics.record_abort(AbortReason::Rejected);
                    return Ok(TxnOutcome {
                        txn_id,
                        status: TxnStatus::Aborted,
                        hlc,
                        abort_reason: Some(AbortReason::Rejected),
                    });
                }
                Err(err) => return Err(err),
            }
        }

        // Conflict check against entries already committed with an earlier
        // HLC. Nothing is staged yet, so an abort here needs no entries.
        {
            let logs = Self::dyn_logs(&self.logs);
            let coord = &self.replicas[coord_leader];
            if txn_conflicts_with_committed(&txn, &logs, &coord.txns, &coord.scene, &settled_below)? {
                info!(txn_id, "transaction aborted by conflict detector");
                self.metrics.record_abort(AbortReason::Conflict);
                return Ok(TxnOutcome {
                    txn_id,
                    status: TxnStatus::Aborted,
                    hlc,
                    abort_reason: Some(AbortReason::Conflict),
                });
            }
        }

        // A transaction with no participants has nothing to stage or apply.
        if txn.shards.is_empty() {
            self.metrics.record_commit();
            return Ok(TxnOutcome {
                txn_id,
                status: TxnStatus::Committed,
                hlc,
                abort_reason: None,
            });
        }

        // Stage: intent on the coordinator shard, stubs elsewhere. Leaders
        // of receiving shards join the transaction's timestamp.
        for &shard in &txn.shards {
            if let Some(leader) = self.logs[shard as usize].current_leader() {
                let pt = self.clock.now_pt();
                self.replicas[leader].hlc.observe(pt, txn.hlc);
            }
        }
        {
            let logs = Self::dyn_logs(&self.logs);
            match coordinator::stage(&txn, &logs) {
                Ok(()) => {}
                Err(SceneError::NoLeader(_)) | Err(SceneError::NotLeader { .. }) => {
                    coordinator::stage_abort(&txn, &logs, hlc);
                    drop(logs);
                    self.converge()?;
                    self.metrics.record_abort(AbortReason::NoLeader);
                    return Ok(TxnOutcome {
                        txn_id,
                        status: TxnStatus::Aborted,
                        hlc,
                        abort_reason: Some(AbortReason::NoLeader),
                    });
                }
                Err(err) => return Err(err),
            }
        }

        // Drive to a terminal status: drain appliers, re-check conflicts as
        // earlier-HLC entries commit, and enforce the MaxLatency window.
        let max_rounds = self.config.max_latency * 2 + 32;
        for _ in 0..max_rounds {
            self.step()?;

            if let Some(status) = self.replicas[coord_leader].txns.status(txn_id) {
                match status {
                    TxnStatus::Committed => {
                        self.metrics.record_commit();
                        if is_migration {
                            self.metrics.record_migration();
                        }
                        self.gc_txns();
                        return Ok(TxnOutcome {
                            txn_id,
                            status: TxnStatus::Committed,
                            hlc,
                            abort_reason: None,
                        });
                    }
                    TxnStatus::Aborted => {
                        self.metrics.record_abort(AbortReason::HlcWindow);
                        return Ok(TxnOutcome {
                            txn_id,
                            status: TxnStatus::Aborted,
                            hlc,
                            abort_reason: Some(AbortReason::HlcWindow),
                        });
                    }
                    TxnStatus::Committing => {}
                }
            }

            // Entries with an earlier HLC may have committed since staging.
            {
                let logs = Self::dyn_logs(&self.logs);
                let coord = &self.replicas[coord_leader];
                if txn_conflicts_with_committed(&txn, &logs, &coord.txns, &coord.scene, &settled_below)? {
                    coordinator::stage_abort(&txn, &logs, coord.hlc.last());
                    drop(logs);
                    self.converge()?;
                    info!(txn_id, "in-flight transaction aborted by conflict detector");
                    self.metrics.record_abort(AbortReason::Conflict);
                    return Ok(TxnOutcome {
                        txn_id,
                        status: TxnStatus::Aborted,
                        hlc,
                        abort_reason: Some(AbortReason::Conflict),
                    });
                }
            }

            // Advance time; the coordinator decides expiry durably.
            let pt = self.clock.tick();
            let now = self.replicas[coord_leader].hlc.tick(pt);
            let logs = Self::dyn_logs(&self.logs);
            match check_parallel_commit(&txn, &logs, now, self.config.max_latency)? {
                Decision::Expired => {
                    coordinator::stage_abort(&txn, &logs, now);
                    drop(logs);
                    self.converge()?;
                    info!(txn_id, "transaction aborted after MaxLatency window");
                    self.metrics.record_abort(AbortReason::HlcWindow);
                    return Ok(TxnOutcome {
                        txn_id,
                        status: TxnStatus::Aborted,
                        hlc,
                        abort_reason: Some(AbortReason::HlcWindow),
                    });
                }
                Decision::Commit | Decision::Abort | Decision::Wait => {}
            }
        }

        Err(SceneError::InvariantViolation(format!(
            "transaction {} failed to reach a terminal status",
            txn_id
        )))
    }

    // ── Reads ──────────────────────────────────────────────────────────

    /// Read one node from the leader of its owning shard.
    pub fn get(&self, node: NodeId) -> Result<NodeView> {
        let replica = self.read_replica(node)?;
        let record = replica
            .scene
            .get(node)
            .ok_or(SceneError::NodeNotFound(node))?;
        Ok(NodeView {
            left_child: record.left_child,
            right_sibling: record.right_sibling,
            properties: record.properties.clone(),
        })
    }

    /// Ordered children of a node, from the leader of its owning shard.
    pub fn ordered_children(&self, node: NodeId) -> Result<Vec<NodeId>> {
        self.read_replica(node)?.scene.ordered_children(node)
    }

    fn read_replica(&self, node: NodeId) -> Result<&Replica> {
        let owner = self
            .first_live()?
            .shard_map
            .owner(node)
            .ok_or(SceneError::NodeNotFound(node))?;
        let leader = self.logs[owner as usize]
            .current_leader()
            .ok_or(SceneError::NoLeader(owner))?;
        let replica = &self.replicas[leader];
        if replica.crashed {
            return Err(SceneError::ReplicaCrashed(leader));
        }
        Ok(replica)
    }

    // ── Crash and recovery ─────────────────────────────────────────────

    pub fn crash(&mut self, replica: ReplicaId) -> Result<()> {
        let replica = self
            .replicas
            .get_mut(replica)
            .ok_or(SceneError::UnknownReplica(replica))?;
        replica.crashed = true;
        info!(replica = replica.id, "replica crashed");
        Ok(())
    }

    pub fn recover(&mut self, replica: ReplicaId) -> Result<RecoveryReport> {
        let logs = Self::dyn_logs(&self.logs);
        let target = self
            .replicas
            .get_mut(replica)
            .ok_or(SceneError::UnknownReplica(replica))?;
        recovery::recover(target, &logs, self.clock.as_ref(), &self.metrics)
    }

    // ── Maintenance ────────────────────────────────────────────────────

    /// Garbage-collect terminal transaction records on every replica.
    pub fn gc_txns(&mut self) -> usize {
        let max_latency = self.config.max_latency;
        self.replicas
            .iter_mut()
            .map(|r| {
                let now = r.hlc.last();
                r.txns.gc(now, max_latency)
            })
            .sum()
    }

    /// Assert LCRS validity on every live replica.
    pub fn validate(&self) -> Result<()> {
        for replica in &self.replicas {
            if !replica.crashed {
                replica.scene.validate()?;
            }
        }
        Ok(())
    }
}
