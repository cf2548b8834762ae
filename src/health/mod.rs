//! Periodic TCP reachability probe for registered nodes.
//!
//! The probe does not speak the aggregator protocol; a completed TCP
//! connect within the timeout counts as healthy. Only state transitions
//! are logged (`RECOVERED`, `FAILED`). The loop is fail-open: per-node
//! errors are recorded and the next tick retries.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{FileMeshError, Result};
use crate::registry::{NodeHandle, NodeRegistry};

/// Periodic reachability checker flipping registry health flags.
#[derive(Debug)]
pub struct HealthProbe {
    registry: Arc<NodeRegistry>,
    interval: Duration,
    timeout: Duration,
}

impl HealthProbe {
    /// Build a probe. Rejects an interval shorter than the per-probe
    /// timeout: a slow probe must never overlap the next tick.
    pub fn new(registry: Arc<NodeRegistry>, interval: Duration, timeout: Duration) -> Result<Self> {
        if interval < timeout {
            return Err(FileMeshError::ConfigInvalid(format!(
                "probe interval {interval:?} must be >= probe timeout {timeout:?}"
            )));
        }
        Ok(HealthProbe {
            registry,
            interval,
            timeout,
        })
    }

    /// Run the probe loop until the token is cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            interval_ms = self.interval.as_millis() as u64,
            timeout_ms = self.timeout.as_millis() as u64,
            "health probe started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("health probe stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.probe_all().await;
                }
            }
        }
    }

    /// Probe every registered node concurrently and apply the results.
    pub async fn probe_all(&self) {
        let nodes = self.registry.snapshot_all();
        if nodes.is_empty() {
            return;
        }
        let checks = nodes.iter().map(|node| self.probe_node(node.clone()));
        let results = futures::future::join_all(checks).await;

        for (node, reachable) in nodes.iter().zip(results) {
            // A node unregistered mid-probe is NotFound here; drop the result.
            match self.registry.set_health(&node.id, reachable) {
                Ok(prior) => {
                    if prior && !reachable {
                        warn!(node = %node.id, "FAILED: node unreachable");
                    } else if !prior && reachable {
                        info!(node = %node.id, "RECOVERED: node reachable again");
                    }
                }
                Err(_) => {
                    debug!(node = %node.id, "probe result dropped for unregistered node");
                }
            }
        }
    }

    async fn probe_node(&self, node: NodeHandle) -> bool {
        let addr = (node.host.clone(), node.port);
        match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(err)) => {
                debug!(node = %node.id, error = %err, "probe connect failed");
                false
            }
            Err(_) => {
                debug!(node = %node.id, "probe timed out");
                false
            }
        }
    }
}
