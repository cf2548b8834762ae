//! Shared load-balancer counters surfaced by `/api/health`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Monotonic counters updated by the API layer and the worker pool.
#[derive(Debug, Default)]
pub struct LbStats {
    /// Requests accepted and enqueued by the public API.
    pub accepted: AtomicU64,
    /// Requests rejected at admission (validation, size, queue full).
    pub rejected: AtomicU64,
    /// Requests taken off the queue by workers.
    pub taken: AtomicU64,
    /// Forwards that completed with a success status.
    pub forwarded: AtomicU64,
    /// Forwards that failed (network error, timeout, 5xx).
    pub forward_failures: AtomicU64,
    /// Requests dropped because no healthy node was available.
    pub dropped_no_nodes: AtomicU64,
    /// Requests re-enqueued after finding no healthy node.
    pub requeued: AtomicU64,
    /// Requests dropped because they outlived the queue TTL.
    pub expired: AtomicU64,
}

impl LbStats {
    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            taken: self.taken.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            forward_failures: self.forward_failures.load(Ordering::Relaxed),
            dropped_no_nodes: self.dropped_no_nodes.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            last_update: SystemTime::now(),
        }
    }

    /// Bump a counter by one.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Serializable view of [`LbStats`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Requests accepted and enqueued.
    pub accepted: u64,
    /// Requests rejected at admission.
    pub rejected: u64,
    /// Requests taken off the queue.
    pub taken: u64,
    /// Successful forwards.
    pub forwarded: u64,
    /// Failed forwards.
    pub forward_failures: u64,
    /// Drops for lack of healthy nodes.
    pub dropped_no_nodes: u64,
    /// Re-enqueues for lack of healthy nodes.
    pub requeued: u64,
    /// TTL expiries.
    pub expired: u64,
    /// Snapshot timestamp.
    pub last_update: SystemTime,
}
