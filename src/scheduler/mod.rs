//! Node selection policies.
//!
//! The queue decides *when* a request runs; the policy decides *where*.
//! All policies operate on the immutable healthy-snapshot handed in by the
//! worker, return `None` on an empty snapshot, and never inspect health
//! themselves — an unhealthy node simply never appears in the input.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::queue::QueuedRequest;
use crate::registry::NodeHandle;
use crate::settings::SchedulerKind;

/// A node selection policy. Implementations must be cheap and lock-free;
/// they run on every dispatch.
pub trait SelectionPolicy: Send + Sync {
    /// Policy name for logs and the health endpoint.
    fn name(&self) -> &'static str;

    /// Pick one node from the healthy snapshot for `request`.
    fn select(&self, healthy: &[NodeHandle], request: &QueuedRequest) -> Option<NodeHandle>;
}

/// Build the policy selected by configuration.
pub fn build_policy(kind: SchedulerKind) -> Box<dyn SelectionPolicy> {
    match kind {
        SchedulerKind::Fcfs => Box::new(LeastLoaded),
        SchedulerKind::Sjn => Box::new(ShortestJobSpread::default()),
        SchedulerKind::RoundRobin => Box::new(RoundRobin::default()),
    }
}

/// FCFS: the queue already provides order, so dispatch to the freest
/// backend. Ties break by snapshot (registration) order.
pub struct LeastLoaded;

impl SelectionPolicy for LeastLoaded {
    fn name(&self) -> &'static str {
        "FCFS"
    }

    fn select(&self, healthy: &[NodeHandle], _request: &QueuedRequest) -> Option<NodeHandle> {
        healthy.iter().min_by_key(|n| n.in_flight()).cloned()
    }
}

/// SJN: the queue is already size-ordered, so the policy's only job is to
/// spread those small jobs evenly across the healthy set.
#[derive(Default)]
pub struct ShortestJobSpread {
    cursor: AtomicUsize,
}

impl SelectionPolicy for ShortestJobSpread {
    fn name(&self) -> &'static str {
        "SJN"
    }

    fn select(&self, healthy: &[NodeHandle], _request: &QueuedRequest) -> Option<NodeHandle> {
        if healthy.is_empty() {
            return None;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Some(healthy[i].clone())
    }
}

/// Round-robin rotation with a thread-safe monotonic counter.
#[derive(Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl SelectionPolicy for RoundRobin {
    fn name(&self) -> &'static str {
        "ROUNDROBIN"
    }

    fn select(&self, healthy: &[NodeHandle], _request: &QueuedRequest) -> Option<NodeHandle> {
        if healthy.is_empty() {
            return None;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Some(healthy[i].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::RequestKind;
    use crate::registry::{LoadGuard, NodeRegistry};

    fn request() -> QueuedRequest {
        QueuedRequest::new("r1", "f1", RequestKind::Upload, 0)
    }

    fn three_nodes() -> (NodeRegistry, Vec<NodeHandle>) {
        let reg = NodeRegistry::new();
        for i in 1..=3 {
            reg.register(&format!("n{i}"), "localhost", 4847 + i).unwrap();
        }
        let snap = reg.snapshot_healthy();
        (reg, snap)
    }

    #[test]
    fn all_policies_return_none_on_empty_input() {
        let req = request();
        assert!(LeastLoaded.select(&[], &req).is_none());
        assert!(ShortestJobSpread::default().select(&[], &req).is_none());
        assert!(RoundRobin::default().select(&[], &req).is_none());
    }

    #[test]
    fn round_robin_rotates_in_order() {
        let (_reg, snap) = three_nodes();
        let policy = RoundRobin::default();
        let picks: Vec<String> = (0..6)
            .map(|_| policy.select(&snap, &request()).unwrap().id.clone())
            .collect();
        assert_eq!(picks, vec!["n1", "n2", "n3", "n1", "n2", "n3"]);
    }

    #[test]
    fn least_loaded_prefers_freest_node() {
        let (_reg, snap) = three_nodes();
        let policy = LeastLoaded;

        let _g1 = LoadGuard::acquire(&snap[0]);
        let _g2 = LoadGuard::acquire(&snap[1]);
        assert_eq!(policy.select(&snap, &request()).unwrap().id, "n3");
    }

    #[test]
    fn least_loaded_ties_break_by_registration_order() {
        let (_reg, snap) = three_nodes();
        assert_eq!(LeastLoaded.select(&snap, &request()).unwrap().id, "n1");
    }

    #[test]
    fn round_robin_counter_survives_shrinking_snapshot() {
        let (reg, snap) = three_nodes();
        let policy = RoundRobin::default();
        policy.select(&snap, &request());
        policy.select(&snap, &request());

        reg.set_health("n2", false).unwrap();
        let snap = reg.snapshot_healthy();
        // Two healthy nodes left; selection keeps rotating without panicking.
        let pick = policy.select(&snap, &request()).unwrap();
        assert!(pick.id == "n1" || pick.id == "n3");
    }
}
