//! Hybrid logical clocks.
//!
//! Every log entry carries an [`HlcTimestamp`], a `(l, c)` pair compared
//! lexicographically. The logical component `l` never falls behind the last
//! observed physical tick; `c` disambiguates events sharing the same `l`.
//! [`HlcClock`] advances on local events (append) and joins incoming
//! timestamps on receive, so cross-shard causality is preserved without any
//! wall-clock dependency; physical ticks come from a [`ClockSource`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Timestamp attached to every log entry and transaction.
///
/// Ordering is lexicographic on `(l, c)`, which the derived `Ord` provides
/// given the field order below.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct HlcTimestamp {
    /// Logical component; always >= the last observed physical tick.
    pub l: u64,
    /// Tie-breaking counter for events sharing `l`.
    pub c: u32,
}

impl HlcTimestamp {
    pub const ZERO: HlcTimestamp = HlcTimestamp { l: 0, c: 0 };

    #[inline]
    pub const fn new(l: u64, c: u32) -> Self {
        Self { l, c }
    }

    /// Logical distance from `earlier` to `self`, in ticks. Saturates at
    /// zero when `earlier` is ahead. This is the quantity compared against
    /// `MaxLatency` for the parallel-commit timeout window.
    #[inline]
    pub fn diff(&self, earlier: HlcTimestamp) -> u64 {
        self.l.saturating_sub(earlier.l)
    }
}

/// Source of monotonic physical ticks.
///
/// Safety never depends on the tick values, only liveness of the
/// `MaxLatency` window does, so a plain counter is a valid source.
pub trait ClockSource: Send + Sync {
    fn now_pt(&self) -> u64;
}

/// Shared tick counter used as the physical clock for a whole cluster.
///
/// Tests and the deterministic convergence loop advance it explicitly;
/// the server binary drives it from a ticker thread.
#[derive(Debug, Default)]
pub struct TickClock {
    ticks: AtomicU64,
}

impl TickClock {
    pub fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
        }
    }

    /// Advance the physical clock by one tick and return the new value.
    pub fn tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl ClockSource for TickClock {
    fn now_pt(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }
}

/// Per-replica hybrid logical clock.
///
/// `tick` implements the local-event rule used when the shard leader appends
/// an entry; `observe` implements the join rule applied before appending an
/// entry that carries a remote timestamp. Both keep the clock monotonic.
#[derive(Debug, Clone, Default)]
pub struct HlcClock {
    last: HlcTimestamp,
}

impl HlcClock {
    pub fn new() -> Self {
        Self {
            last: HlcTimestamp::ZERO,
        }
    }

    /// Last timestamp handed out or observed.
    #[inline]
    pub fn last(&self) -> HlcTimestamp {
        self.last
    }

    /// Local event at physical tick `pt`: if the logical component is still
    /// ahead of the physical clock, bump the counter; otherwise jump to `pt`.
    pub fn tick(&mut self, pt: u64) -> HlcTimestamp {
        if self.last.l >= pt {
            self.last.c += 1;
        } else {
            self.last = HlcTimestamp::new(pt, 0);
        }
        self.last
    }

    /// Message event: join an incoming timestamp with the local clock and
    /// physical tick, `l' = max(pt, l, incoming.l)`, counter chosen so the
    /// result strictly follows both inputs.
    pub fn observe(&mut self, pt: u64, incoming: HlcTimestamp) -> HlcTimestamp {
        let l = pt.max(self.last.l).max(incoming.l);
        let c = if l == self.last.l && l == incoming.l {
            self.last.c.max(incoming.c) + 1
        } else if l == self.last.l {
            self.last.c + 1
        } else if l == incoming.l {
            incoming.c + 1
        } else {
            0
        };
        self.last = HlcTimestamp::new(l, c);
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lexicographic_order() {
        assert!(HlcTimestamp::new(1, 0) < HlcTimestamp::new(2, 0));
        assert!(HlcTimestamp::new(2, 1) < HlcTimestamp::new(2, 2));
        assert!(HlcTimestamp::new(2, 9) < HlcTimestamp::new(3, 0));
    }

    #[test]
    fn test_tick_is_monotonic() {
        let mut clock = HlcClock::new();
        let a = clock.tick(1);
        let b = clock.tick(1); // physical clock stalled
        let c = clock.tick(5);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(c, HlcTimestamp::new(5, 0));
    }

    #[test]
    fn test_observe_joins_remote_timestamp() {
        let mut clock = HlcClock::new();
        clock.tick(3);
        let joined = clock.observe(3, HlcTimestamp::new(7, 2));
        assert_eq!(joined, HlcTimestamp::new(7, 3));

        // A later local tick past the joined l resets the counter.
        let next = clock.tick(8);
        assert_eq!(next, HlcTimestamp::new(8, 0));
    }

    #[test]
    fn test_observe_equal_components_breaks_tie() {
        let mut clock = HlcClock::new();
        clock.tick(4);
        let joined = clock.observe(4, HlcTimestamp::new(4, 9));
        assert_eq!(joined, HlcTimestamp::new(4, 10));
        assert!(clock.last() > HlcTimestamp::new(4, 9));
    }

    #[test]
    fn test_diff_saturates() {
        let a = HlcTimestamp::new(20, 0);
        let b = HlcTimestamp::new(4, 7);
        assert_eq!(a.diff(b), 16);
        assert_eq!(b.diff(a), 0);
    }

    #[test]
    fn test_tick_clock_advances() {
        let clock = TickClock::new();
        assert_eq!(clock.now_pt(), 0);
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.tick(), 2);
        assert_eq!(clock.now_pt(), 2);
    }
}
