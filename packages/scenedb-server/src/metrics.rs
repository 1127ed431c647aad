//! Performance counters for the scene store.
//!
//! Lightweight, thread-safe collection using only atomics; one instance per
//! server, shared behind an `Arc` by request handlers and applier loops.
//! Entry applications count once per replica, so a three-replica cluster
//! applying one entry adds three.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

use crate::txn::AbortReason;

/// Thread-safe metrics collector.
#[derive(Debug)]
pub struct Metrics {
    /// Log entries applied, summed over replicas and shards.
    entries_applied: AtomicU64,
    /// Transactions that reached `Committed`.
    txns_committed: AtomicU64,
    /// Transactions that reached `Aborted`, any reason.
    txns_aborted: AtomicU64,
    /// Aborts from the conflict detector.
    aborts_conflict: AtomicU64,
    /// Aborts from the `MaxLatency` window.
    aborts_hlc_window: AtomicU64,
    /// Aborts from operation validation.
    aborts_rejected: AtomicU64,
    /// Aborts from unreachable shard leaders.
    aborts_no_leader: AtomicU64,
    /// Subtree migrations committed.
    migrations: AtomicU64,
    /// Recovery passes completed.
    recoveries: AtomicU64,
    /// Entries replayed by recovery passes.
    entries_replayed: AtomicU64,
    started_at: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            entries_applied: AtomicU64::new(0),
            txns_committed: AtomicU64::new(0),
            txns_aborted: AtomicU64::new(0),
            aborts_conflict: AtomicU64::new(0),
            aborts_hlc_window: AtomicU64::new(0),
            aborts_rejected: AtomicU64::new(0),
            aborts_no_leader: AtomicU64::new(0),
            migrations: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
            entries_replayed: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn record_entry_applied(&self) {
        self.entries_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.txns_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abort(&self, reason: AbortReason) {
        self.txns_aborted.fetch_add(1, Ordering::Relaxed);
        let counter = match reason {
            AbortReason::Conflict => &self.aborts_conflict,
            AbortReason::HlcWindow => &self.aborts_hlc_window,
            AbortReason::Rejected => &self.aborts_rejected,
            AbortReason::NoLeader => &self.aborts_no_leader,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_migration(&self) {
        self.migrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovery(&self, entries: usize) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
        self.entries_replayed
            .fetch_add(entries as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            entries_applied: self.entries_applied.load(Ordering::Relaxed),
            txns_committed: self.txns_committed.load(Ordering::Relaxed),
            txns_aborted: self.txns_aborted.load(Ordering::Relaxed),
            aborts_conflict: self.aborts_conflict.load(Ordering::Relaxed),
            aborts_hlc_window: self.aborts_hlc_window.load(Ordering::Relaxed),
            aborts_rejected: self.aborts_rejected.load(Ordering::Relaxed),
            aborts_no_leader: self.aborts_no_leader.load(Ordering::Relaxed),
            migrations: self.migrations.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            entries_replayed: self.entries_replayed.load(Ordering::Relaxed),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of all counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub entries_applied: u64,
    pub txns_committed: u64,
    pub txns_aborted: u64,
    pub aborts_conflict: u64,
    pub aborts_hlc_window: u64,
    pub aborts_rejected: u64,
    pub aborts_no_leader: u64,
    pub migrations: u64,
    pub recoveries: u64,
    pub entries_replayed: u64,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.record_entry_applied();
        metrics.record_entry_applied();
        metrics.record_commit();
        metrics.record_abort(AbortReason::Conflict);
        metrics.record_abort(AbortReason::HlcWindow);
        metrics.record_recovery(5);

        let snap = metrics.snapshot();
        assert_eq!(snap.entries_applied, 2);
        assert_eq!(snap.txns_committed, 1);
        assert_eq!(snap.txns_aborted, 2);
        assert_eq!(snap.aborts_conflict, 1);
        assert_eq!(snap.aborts_hlc_window, 1);
        assert_eq!(snap.recoveries, 1);
        assert_eq!(snap.entries_replayed, 5);
    }
}
