//! Queue-pressure sensor driving elastic scaling.
//!
//! Every tick the sensor samples queue depth and healthy node count and
//! publishes scale intents on the bus. Intents are at-most-once: if the bus
//! is down they are dropped with a warning and the next tick re-evaluates
//! from scratch. The host manager's idempotent, bounds-checked processing
//! tolerates both loss and duplication.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{BusAdapter, ScaleIntent, TOPIC_SCALING_REQUESTS};
use crate::queue::PriorityQueue;
use crate::registry::NodeRegistry;

/// Sensor tuning knobs.
#[derive(Debug, Clone)]
pub struct SensorConfig {
    /// Sampling period.
    pub tick: Duration,
    /// Queue depth above which scale-up intents are published.
    pub up_threshold: usize,
    /// Requests one backend node is assumed to absorb.
    pub per_node_capacity: usize,
    /// Consecutive empty ticks before a scale-down intent.
    pub down_grace_ticks: u32,
    /// Minimum gap between two intents of the same direction.
    pub cooldown: Duration,
    /// Fleet upper bound; scale-up never asks beyond `max - healthy`.
    pub max_containers: u32,
    /// Fleet lower bound; scale-down never undercuts it.
    pub min_containers: u32,
}

/// Periodic scaling sensor.
pub struct ScalingSensor {
    queue: Arc<PriorityQueue>,
    registry: Arc<NodeRegistry>,
    bus: Arc<dyn BusAdapter>,
    config: SensorConfig,
    seq: AtomicU64,
}

impl ScalingSensor {
    /// Assemble a sensor; nothing runs until [`ScalingSensor::run`].
    pub fn new(
        queue: Arc<PriorityQueue>,
        registry: Arc<NodeRegistry>,
        bus: Arc<dyn BusAdapter>,
        config: SensorConfig,
    ) -> Self {
        ScalingSensor {
            queue,
            registry,
            bus,
            config,
            seq: AtomicU64::new(1),
        }
    }

    /// Run the sampling loop until the token cancels.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            tick_ms = self.config.tick.as_millis() as u64,
            up_threshold = self.config.up_threshold,
            "scaling sensor started"
        );

        let mut empty_ticks: u32 = 0;
        let mut last_up: Option<Instant> = None;
        let mut last_down: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("scaling sensor stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let depth = self.queue.len();
            let healthy = self.registry.healthy_count();
            debug!(depth, healthy, empty_ticks, "scaling sample");

            if depth > self.config.up_threshold {
                empty_ticks = 0;
                if !cooled_down(last_up, self.config.cooldown) {
                    continue;
                }
                let backlog = depth - self.config.up_threshold;
                let want = backlog.div_ceil(self.config.per_node_capacity) as u32;
                let room = self.config.max_containers.saturating_sub(healthy as u32);
                let count = want.min(room);
                if count == 0 {
                    debug!(depth, healthy, "scale-up wanted but fleet is at max");
                    continue;
                }
                if self.publish(ScaleIntent::Up { count, seq: self.next_seq() }).await {
                    last_up = Some(Instant::now());
                }
            } else if depth == 0 {
                empty_ticks += 1;
                if empty_ticks < self.config.down_grace_ticks
                    || healthy as u32 <= self.config.min_containers
                    || !cooled_down(last_down, self.config.cooldown)
                {
                    continue;
                }
                if self.publish(ScaleIntent::Down { count: 1, seq: self.next_seq() }).await {
                    last_down = Some(Instant::now());
                    empty_ticks = 0;
                }
            } else {
                empty_ticks = 0;
            }
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    async fn publish(&self, intent: ScaleIntent) -> bool {
        let payload = match serde_json::to_vec(&intent) {
            Ok(p) => p,
            Err(err) => {
                warn!(error = %err, "scale intent serialization failed");
                return false;
            }
        };
        match self.bus.publish(TOPIC_SCALING_REQUESTS, payload).await {
            Ok(()) => {
                info!(action = intent.action(), seq = intent.seq(), "scale intent published");
                true
            }
            Err(err) => {
                // At-most-once: drop and let the next tick re-evaluate.
                warn!(error = %err, action = intent.action(), "bus unavailable, intent dropped");
                false
            }
        }
    }
}

fn cooled_down(last: Option<Instant>, cooldown: Duration) -> bool {
    last.map_or(true, |t| t.elapsed() >= cooldown)
}
