//! Process-wide traffic accounting.
//!
//! The counters are the only shared mutable state in the whole engine.
//! Writers bump atomics; observers take value snapshots and may see
//! slightly stale numbers, which is fine for a status line.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Monotonic byte/connection counters plus the live-relay gauge.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    active_relays: AtomicU64,
    total_relays: AtomicU64,
}

impl TrafficCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bytes copied from a local client toward the remote end.
    pub fn add_up(&self, n: u64) {
        self.bytes_up.fetch_add(n, Ordering::Relaxed);
    }

    /// Bytes copied from the remote end back to a local client.
    pub fn add_down(&self, n: u64) {
        self.bytes_down.fetch_add(n, Ordering::Relaxed);
    }

    /// Account one admitted connection. The returned guard keeps the
    /// connection counted as active until it is dropped.
    pub fn admit(self: &Arc<Self>) -> ConnectionGuard {
        self.total_relays.fetch_add(1, Ordering::Relaxed);
        self.active_relays.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            counters: self.clone(),
        }
    }

    pub fn active(&self) -> u64 {
        self.active_relays.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
            active_relays: self.active_relays.load(Ordering::Relaxed),
            total_relays: self.total_relays.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the active-relay gauge exactly once, on drop, no matter
/// how the connection task exits.
pub struct ConnectionGuard {
    counters: Arc<TrafficCounters>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counters.active_relays.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrafficSnapshot {
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub active_relays: u64,
    pub total_relays: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admit_and_release_balance() {
        let counters = TrafficCounters::new();
        {
            let _a = counters.admit();
            let _b = counters.admit();
            assert_eq!(counters.active(), 2);
            assert_eq!(counters.snapshot().total_relays, 2);
        }
        assert_eq!(counters.active(), 0);
        // Lifetime total is not decremented.
        assert_eq!(counters.snapshot().total_relays, 2);
    }

    #[test]
    fn byte_counters_accumulate() {
        let counters = TrafficCounters::new();
        counters.add_up(700);
        counters.add_up(300);
        counters.add_down(42);
        let snap = counters.snapshot();
        assert_eq!(snap.bytes_up, 1000);
        assert_eq!(snap.bytes_down, 42);
    }
}
