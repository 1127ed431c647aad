//! Multi-shard transactions.
//!
//! A transaction is created in `Committing` and transitions exactly once to
//! `Committed` or `Aborted`. Records stay addressable on every participant
//! until their terminal status is durable, then age out of the pending
//! table once older than the oldest in-flight transaction plus the
//! `MaxLatency` window.

pub mod conflict;
pub mod coordinator;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::hlc::HlcTimestamp;
use crate::scene::SceneOp;
use crate::shard::ShardId;

pub type TxnId = u64;

/// Transaction lifecycle. `Committing -> {Committed, Aborted}`, no
/// intermediate states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnStatus {
    Committing,
    Committed,
    Aborted,
}

impl TxnStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TxnStatus::Committing)
    }
}

/// Why a transaction aborted, for the client response and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    /// An operation failed validation (nonexistent target, reused id, ...).
    Rejected,
    /// The conflict detector tripped against an earlier committed entry.
    Conflict,
    /// The transaction's HLC drifted past the `MaxLatency` window while
    /// still committing.
    HlcWindow,
    /// No leader reachable for a participating shard.
    NoLeader,
}

/// An operation together with the shard whose log carries it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutedOp {
    pub shard: ShardId,
    pub op: SceneOp,
}

/// Full transaction state: the coordinator intent written to the
/// coordinator shard's log, and the record tracked in every replica's
/// pending table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnRecord {
    pub txn_id: TxnId,
    pub status: TxnStatus,
    /// Participating shards, ascending, no duplicates.
    pub shards: Vec<ShardId>,
    pub coord_shard: ShardId,
    pub hlc: HlcTimestamp,
    pub ops: Vec<RoutedOp>,
}

impl TxnRecord {
    /// Build a committing record. The coordinator shard is the smallest
    /// participating shard id (deterministic tie-break).
    pub fn committing(
        txn_id: TxnId,
        mut shards: Vec<ShardId>,
        hlc: HlcTimestamp,
        ops: Vec<RoutedOp>,
    ) -> Self {
        shards.sort_unstable();
        shards.dedup();
        let coord_shard = shards.first().copied().unwrap_or(0);
        Self {
            txn_id,
            status: TxnStatus::Committing,
            shards,
            coord_shard,
            hlc,
            ops,
        }
    }
}

/// Per-replica table of transactions awaiting (or recently past) their
/// terminal transition.
#[derive(Debug, Clone, Default)]
pub struct TxnTable {
    txns: HashMap<TxnId, TxnRecord>,
}

impl TxnTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transaction if unseen. An existing record wins: replicas
    /// may observe the same intent through replay.
    pub fn observe(&mut self, record: &TxnRecord) {
        self.txns.entry(record.txn_id).or_insert_with(|| record.clone());
    }

    pub fn get(&self, txn_id: TxnId) -> Option<&TxnRecord> {
        self.txns.get(&txn_id)
    }

    pub fn status(&self, txn_id: TxnId) -> Option<TxnStatus> {
        self.txns.get(&txn_id).map(|t| t.status)
    }

    /// Transition a transaction to a terminal status. Returns true if this
    /// call performed the transition, false if it already happened; a
    /// conflicting terminal transition is ignored with a warning because the
    /// first durable decision is binding.
    pub fn transition(&mut self, txn_id: TxnId, status: TxnStatus) -> bool {
        debug_assert!(status.is_terminal());
        match self.txns.get_mut(&txn_id) {
            Some(record) if record.status == TxnStatus::Committing => {
                record.status = status;
                true
            }
            Some(record) => {
                if record.status != status {
                    debug!(
                        txn_id,
                        current = ?record.status,
                        requested = ?status,
                        "ignoring late conflicting transition"
                    );
                }
                false
            }
            None => false,
        }
    }

    /// Ids of transactions still committing.
    pub fn in_flight(&self) -> Vec<TxnId> {
        let mut ids: Vec<TxnId> = self
            .txns
            .values()
            .filter(|t| t.status == TxnStatus::Committing)
            .map(|t| t.txn_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Drop terminal records older than the oldest in-flight transaction
    /// (or `now` when idle) minus the latency window. Returns how many were
    /// collected.
    pub fn gc(&mut self, now: HlcTimestamp, max_latency: u64) -> usize {
        let horizon = self
            .txns
            .values()
            .filter(|t| t.status == TxnStatus::Committing)
            .map(|t| t.hlc)
            .min()
            .unwrap_or(now);
        let before = self.txns.len();
        self.txns.retain(|_, t| {
            t.status == TxnStatus::Committing || horizon.diff(t.hlc) <= max_latency
        });
        before - self.txns.len()
    }

    pub fn len(&self) -> usize {
        self.txns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(txn_id: TxnId, l: u64) -> TxnRecord {
        TxnRecord::committing(txn_id, vec![1, 0, 1], HlcTimestamp::new(l, 0), Vec::new())
    }

    #[test]
    fn test_committing_sorts_and_dedups_shards() {
        let txn = record(1, 5);
        assert_eq!(txn.shards, vec![0, 1]);
        assert_eq!(txn.coord_shard, 0);
        assert_eq!(txn.status, TxnStatus::Committing);
    }

    #[test]
    fn test_transition_happens_once() {
        let mut table = TxnTable::new();
        table.observe(&record(1, 5));
        assert!(table.transition(1, TxnStatus::Committed));
        assert!(!table.transition(1, TxnStatus::Committed));
        assert!(!table.transition(1, TxnStatus::Aborted));
        assert_eq!(table.status(1), Some(TxnStatus::Committed));
    }

    #[test]
    fn test_gc_keeps_in_flight_and_recent() {
        let mut table = TxnTable::new();
        table.observe(&record(1, 5));
        table.observe(&record(2, 100));
        table.transition(1, TxnStatus::Aborted);

        // Txn 2 is still committing with hlc l=100, so the horizon is 100
        // and txn 1 (l=5) ages out with a window of 16.
        let collected = table.gc(HlcTimestamp::new(200, 0), 16);
        assert_eq!(collected, 1);
        assert!(table.get(1).is_none());
        assert!(table.get(2).is_some());
    }
}
