//! The dispatch worker pool.
//!
//! A fixed number of workers drain the priority queue. Each dequeued
//! request goes through: healthy-snapshot, policy selection, a uniformly
//! random admission delay (deliberate load shaping, cancellable on
//! shutdown), then a single forward with the node's load slot held for the
//! duration. Every dispatch emits one access-log record.
//!
//! When no healthy node exists the request is dropped with a log record by
//! default; `LB_REQUEUE_ON_NO_NODES` switches to re-enqueueing with a base
//! priority penalty of one. Either way the choice is deterministic.

mod forward;

pub use forward::{ForwardReceipt, Forwarder, HttpForwarder, FORWARD_TIMEOUT};

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::{PriorityQueue, QueuedRequest};
use crate::registry::{LoadGuard, NodeRegistry};
use crate::scheduler::SelectionPolicy;
use crate::stats::LbStats;

/// Worker-pool tuning knobs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Lower bound of the admission delay.
    pub delay_min: Duration,
    /// Upper bound of the admission delay.
    pub delay_max: Duration,
    /// Re-enqueue instead of dropping on `NoHealthyNodes`.
    pub requeue_on_no_nodes: bool,
    /// Drop entries older than this at dequeue time.
    pub queue_ttl: Option<Duration>,
}

const NO_NODES_PAUSE: Duration = Duration::from_millis(500);

struct Shared {
    queue: Arc<PriorityQueue>,
    registry: Arc<NodeRegistry>,
    policy: Box<dyn SelectionPolicy>,
    forwarder: Arc<dyn Forwarder>,
    stats: Arc<LbStats>,
    config: WorkerConfig,
}

/// Fixed pool of queue consumers.
pub struct WorkerPool {
    shared: Arc<Shared>,
}

/// Join handle over the pool's tasks.
pub struct WorkerPoolHandle {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Assemble a pool; nothing runs until [`WorkerPool::start`].
    pub fn new(
        queue: Arc<PriorityQueue>,
        registry: Arc<NodeRegistry>,
        policy: Box<dyn SelectionPolicy>,
        forwarder: Arc<dyn Forwarder>,
        stats: Arc<LbStats>,
        config: WorkerConfig,
    ) -> Self {
        WorkerPool {
            shared: Arc::new(Shared {
                queue,
                registry,
                policy,
                forwarder,
                stats,
                config,
            }),
        }
    }

    /// Spawn the configured number of workers.
    pub fn start(&self, cancel: CancellationToken) -> WorkerPoolHandle {
        let handles = (0..self.shared.config.workers)
            .map(|i| {
                let shared = self.shared.clone();
                let cancel = cancel.clone();
                tokio::spawn(run_worker(shared, i, cancel))
            })
            .collect();
        info!(workers = self.shared.config.workers, policy = self.shared.policy.name(),
              "worker pool started");
        WorkerPoolHandle { handles }
    }
}

impl WorkerPoolHandle {
    /// Wait for all workers to finish, aborting stragglers after `grace`.
    pub async fn join(self, grace: Duration) {
        let aborts: Vec<_> = self.handles.iter().map(|h| h.abort_handle()).collect();
        let drain = futures::future::join_all(self.handles);
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!(grace_ms = grace.as_millis() as u64, "worker drain exceeded grace, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

async fn run_worker(shared: Arc<Shared>, worker_id: usize, cancel: CancellationToken) {
    debug!(worker = worker_id, "worker started");
    while let Some(request) = shared.queue.take(&cancel).await {
        LbStats::inc(&shared.stats.taken);
        dispatch(&shared, request, &cancel).await;
    }
    debug!(worker = worker_id, "worker stopped");
}

async fn dispatch(shared: &Shared, request: QueuedRequest, cancel: &CancellationToken) {
    let wait = request.age_at(Instant::now());
    if let Some(ttl) = shared.config.queue_ttl {
        if wait > ttl {
            LbStats::inc(&shared.stats.expired);
            warn!(request = %request.id, waited_ms = wait.as_millis() as u64,
                  "request outlived queue TTL, dropped");
            return;
        }
    }

    let snapshot = shared.registry.snapshot_healthy();
    let selected = shared.policy.select(&snapshot, &request);
    let Some(node) = selected else {
        if handle_no_nodes(shared, request) {
            // The entry went straight back into the queue; pause so a fully
            // unhealthy fleet does not busy-spin between take and re-offer.
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(NO_NODES_PAUSE) => {}
            }
        }
        return;
    };

    // Deliberate admission-control latency; must die quickly on shutdown.
    let delay = sample_delay(shared.config.delay_min, shared.config.delay_max);
    tokio::select! {
        _ = cancel.cancelled() => {
            warn!(request = %request.id, "shutdown during admission delay, request dropped");
            return;
        }
        _ = tokio::time::sleep(delay) => {}
    }

    let slot = LoadGuard::acquire(&node);
    let started = Instant::now();
    let outcome = shared.forwarder.forward(&request, &node).await;
    let duration = started.elapsed();
    drop(slot);

    match outcome {
        Ok(receipt) => {
            LbStats::inc(&shared.stats.forwarded);
            info!(
                target: "filemesh::access",
                request = %request.id,
                file = %request.file_id,
                kind = request.kind.as_str(),
                node = %node.id,
                policy = shared.policy.name(),
                wait_ms = wait.as_millis() as u64,
                delay_ms = delay.as_millis() as u64,
                forward_ms = duration.as_millis() as u64,
                status = receipt.status,
                outcome = "forwarded",
                "request forwarded"
            );
        }
        Err(err) => {
            LbStats::inc(&shared.stats.forward_failures);
            warn!(
                target: "filemesh::access",
                request = %request.id,
                file = %request.file_id,
                kind = request.kind.as_str(),
                node = %node.id,
                policy = shared.policy.name(),
                wait_ms = wait.as_millis() as u64,
                delay_ms = delay.as_millis() as u64,
                forward_ms = duration.as_millis() as u64,
                outcome = %err,
                "request forward failed"
            );
        }
    }
}

fn handle_no_nodes(shared: &Shared, request: QueuedRequest) -> bool {
    if shared.config.requeue_on_no_nodes {
        let id = request.id.clone();
        let penalty = request.base_priority - 1;
        match shared.queue.offer(request.with_base_priority(penalty)) {
            Ok(()) => {
                LbStats::inc(&shared.stats.requeued);
                warn!(request = %id, "no healthy nodes, request re-enqueued with penalty");
                true
            }
            Err(err) => {
                LbStats::inc(&shared.stats.dropped_no_nodes);
                warn!(request = %id, error = %err, "no healthy nodes and re-enqueue failed, dropped");
                false
            }
        }
    } else {
        LbStats::inc(&shared.stats.dropped_no_nodes);
        warn!(request = %request.id, "no healthy nodes, request dropped");
        false
    }
}

fn sample_delay(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let millis = {
        let mut rng = rand::thread_rng();
        rng.gen_range(min.as_millis() as u64..=max.as_millis() as u64)
    };
    Duration::from_millis(millis)
}
