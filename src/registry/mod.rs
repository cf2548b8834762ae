//! Backend node registry.
//!
//! The registry exclusively owns node records. Readers take point-in-time
//! snapshots (cloned handles, stable registration order) and never block
//! each other; writers serialize on the registry lock. Health and in-flight
//! load live in atomics on the record itself, so a worker holding a handle
//! to an unregistered node can still finish its forward and release its
//! load slot.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::error::{FileMeshError, Result};

/// A single backend aggregator node.
#[derive(Debug)]
pub struct NodeRecord {
    /// Stable node id, unique within the registry.
    pub id: String,
    /// Hostname or address of the node.
    pub host: String,
    /// HTTP port of the node.
    pub port: u16,
    healthy: AtomicBool,
    in_flight: AtomicU32,
}

/// Shared handle to a node record.
pub type NodeHandle = Arc<NodeRecord>;

impl NodeRecord {
    fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> NodeHandle {
        Arc::new(NodeRecord {
            id: id.into(),
            host: host.into(),
            port,
            healthy: AtomicBool::new(true),
            in_flight: AtomicU32::new(0),
        })
    }

    /// Current health flag.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Current number of in-flight forwards against this node.
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Base URL of the node's aggregator API.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    fn inc_load(&self) -> u32 {
        self.in_flight.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn dec_load(&self) -> u32 {
        // Clamped at zero; a stray double-release must not wrap.
        let prev = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
        match prev {
            Ok(p) => p - 1,
            Err(_) => 0,
        }
    }
}

/// RAII guard holding one in-flight load slot on a node.
///
/// The decrement runs on drop, so the release discipline survives every
/// exit path of a forward, including errors.
#[derive(Debug)]
pub struct LoadGuard {
    node: NodeHandle,
}

impl LoadGuard {
    /// Take a load slot on `node`.
    pub fn acquire(node: &NodeHandle) -> Self {
        node.inc_load();
        LoadGuard { node: node.clone() }
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.node.dec_load();
    }
}

/// Serializable per-node view for `/api/health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    /// Node id.
    pub id: String,
    /// Health flag at snapshot time.
    pub healthy: bool,
    /// In-flight load at snapshot time.
    pub in_flight: u32,
}

/// Thread-safe set of backend nodes.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: RwLock<Vec<NodeHandle>>,
}

impl NodeRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node; initial health is `Healthy`.
    pub fn register(&self, id: &str, host: &str, port: u16) -> Result<NodeHandle> {
        let mut nodes = self.nodes.write();
        if nodes.iter().any(|n| n.id == id) {
            return Err(FileMeshError::AlreadyExists(format!("node '{id}'")));
        }
        let node = NodeRecord::new(id, host, port);
        nodes.push(node.clone());
        tracing::info!(node = %id, host, port, "node registered");
        Ok(node)
    }

    /// Remove a node. In-flight forwards against handles already taken keep
    /// running; the node just stops being dispatched to.
    pub fn unregister(&self, id: &str) -> Result<()> {
        let mut nodes = self.nodes.write();
        let before = nodes.len();
        nodes.retain(|n| n.id != id);
        if nodes.len() == before {
            return Err(FileMeshError::NotFound(format!("node '{id}'")));
        }
        tracing::info!(node = %id, "node unregistered");
        Ok(())
    }

    /// Set a node's health flag; idempotent. Returns the prior state.
    pub fn set_health(&self, id: &str, healthy: bool) -> Result<bool> {
        let node = self.get(id)?;
        Ok(node.healthy.swap(healthy, Ordering::AcqRel))
    }

    /// Look up a node handle by id.
    pub fn get(&self, id: &str) -> Result<NodeHandle> {
        self.nodes
            .read()
            .iter()
            .find(|n| n.id == id)
            .cloned()
            .ok_or_else(|| FileMeshError::NotFound(format!("node '{id}'")))
    }

    /// Point-in-time list of healthy nodes in registration order.
    pub fn snapshot_healthy(&self) -> Vec<NodeHandle> {
        self.nodes
            .read()
            .iter()
            .filter(|n| n.is_healthy())
            .cloned()
            .collect()
    }

    /// Point-in-time list of all nodes in registration order.
    pub fn snapshot_all(&self) -> Vec<NodeHandle> {
        self.nodes.read().clone()
    }

    /// Increment a node's in-flight load.
    pub fn inc_load(&self, id: &str) -> Result<u32> {
        Ok(self.get(id)?.inc_load())
    }

    /// Decrement a node's in-flight load, clamped at zero.
    pub fn dec_load(&self, id: &str) -> Result<u32> {
        Ok(self.get(id)?.dec_load())
    }

    /// Number of registered nodes.
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Number of healthy nodes.
    pub fn healthy_count(&self) -> usize {
        self.nodes.read().iter().filter(|n| n.is_healthy()).count()
    }

    /// Per-node status rows for the health endpoint.
    pub fn status(&self) -> Vec<NodeStatus> {
        self.nodes
            .read()
            .iter()
            .map(|n| NodeStatus {
                id: n.id.clone(),
                healthy: n.is_healthy(),
                in_flight: n.in_flight(),
            })
            .collect()
    }
}
