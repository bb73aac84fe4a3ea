//! Router counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counters updated by the scheduler workers.
#[derive(Debug, Default)]
pub struct RouterStats {
    passes: AtomicU64,
    dequeued: AtomicU64,
    delivered: AtomicU64,
    aborted: AtomicU64,
    dest_full: AtomicU64,
    faults: AtomicU64,
    unroutable: AtomicU64,
    decisions_requested: AtomicU64,
    decisions_injected: AtomicU64,
    quarantined: AtomicU64,
    wait_errors: AtomicU64,
    unknown_events: AtomicU64,
}

/// Point-in-time copy of [`RouterStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub passes: u64,
    pub dequeued: u64,
    pub delivered: u64,
    pub aborted: u64,
    pub dest_full: u64,
    pub faults: u64,
    pub unroutable: u64,
    pub decisions_requested: u64,
    pub decisions_injected: u64,
    pub quarantined: u64,
    pub wait_errors: u64,
    pub unknown_events: u64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl RouterStats {
    counter! {
        record_pass => passes,
        record_dequeue => dequeued,
        record_delivery => delivered,
        record_abort => aborted,
        record_dest_full => dest_full,
        record_fault => faults,
        record_unroutable => unroutable,
        record_decision_request => decisions_requested,
        record_decision_injected => decisions_injected,
        record_wait_error => wait_errors,
        record_unknown_event => unknown_events,
    }

    pub fn record_quarantined(&self, count: usize) {
        self.quarantined
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            passes: load(&self.passes),
            dequeued: load(&self.dequeued),
            delivered: load(&self.delivered),
            aborted: load(&self.aborted),
            dest_full: load(&self.dest_full),
            faults: load(&self.faults),
            unroutable: load(&self.unroutable),
            decisions_requested: load(&self.decisions_requested),
            decisions_injected: load(&self.decisions_injected),
            quarantined: load(&self.quarantined),
            wait_errors: load(&self.wait_errors),
            unknown_events: load(&self.unknown_events),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = RouterStats::default();
        stats.record_delivery();
        stats.record_delivery();
        stats.record_quarantined(3);
        let snap = stats.snapshot();
        assert_eq!(snap.delivered, 2);
        assert_eq!(snap.quarantined, 3);
        assert_eq!(snap.passes, 0);
    }

    #[test]
    fn test_snapshot_serializes_as_json() {
        let stats = RouterStats::default();
        stats.record_pass();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["passes"], 1);
    }
}
