use std::sync::atomic::{AtomicU64, Ordering};

use super::event::{EventKind, EVENT_KIND_CARDINALITY};

/// Per-kind line counts drained by one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KindCounts {
    pub parsed: u64,
    pub rejected: u64,
}

/// Lock-free per-EventKind line counters.
///
/// `snapshot()` atomically reads and resets all counters, making it
/// suitable for periodic reporting without contention.
pub struct EventStats {
    parsed: [AtomicU64; EVENT_KIND_CARDINALITY],
    rejected: [AtomicU64; EVENT_KIND_CARDINALITY],
}

impl EventStats {
    /// Create a new zeroed EventStats.
    pub fn new() -> Self {
        Self {
            parsed: std::array::from_fn(|_| AtomicU64::new(0)),
            rejected: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Count one line that parsed into a record.
    pub fn record_parsed(&self, kind: EventKind) {
        if let Some(counter) = self.parsed.get(kind as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count one line that failed to parse.
    pub fn record_rejected(&self, kind: EventKind) {
        if let Some(counter) = self.rejected.get(kind as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Atomically read and reset all counters, returning only kinds that saw
    /// at least one line.
    pub fn snapshot(&self) -> Vec<(EventKind, KindCounts)> {
        let mut result = Vec::new();

        for kind in EventKind::all() {
            let i = *kind as usize;
            let parsed = self
                .parsed
                .get(i)
                .map_or(0, |c| c.swap(0, Ordering::Relaxed));
            let rejected = self
                .rejected
                .get(i)
                .map_or(0, |c| c.swap(0, Ordering::Relaxed));

            if parsed > 0 || rejected > 0 {
                result.push((*kind, KindCounts { parsed, rejected }));
            }
        }

        result
    }
}

impl Default for EventStats {
    fn default() -> Self {
        Self::new()
    }
}
