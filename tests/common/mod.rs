#![allow(dead_code)]

//! Shared test doubles for the integration suite.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use filemesh::error::{FileMeshError, Result};
use filemesh::queue::QueuedRequest;
use filemesh::registry::NodeHandle;
use filemesh::runtime::{ContainerRuntime, RunOutput};
use filemesh::worker::{ForwardReceipt, Forwarder};

fn ok_output(stdout: &str) -> RunOutput {
    RunOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn failed_output(stderr: &str) -> RunOutput {
    RunOutput {
        exit_code: 1,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

/// Recording, scriptable [`ContainerRuntime`].
///
/// `calls` captures every invocation in order. Containers started
/// successfully are added to `running`, so inspects confirm them unless a
/// test removes them to simulate a crash.
#[derive(Default)]
pub struct MockRuntime {
    /// Every invocation, e.g. `start c2 4849 img`, `stop c4`.
    pub calls: Mutex<Vec<String>>,
    /// Container names whose start always fails.
    pub fail_start: Mutex<HashSet<String>>,
    /// Container names whose stop always fails.
    pub fail_stop: Mutex<HashSet<String>>,
    /// Containers inspect reports as running.
    pub running: Mutex<HashSet<String>>,
    /// Containers list() reports as existing.
    pub existing: Mutex<Vec<String>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runtime pre-populated with existing, running containers.
    pub fn with_existing(names: &[&str]) -> Self {
        let rt = Self::default();
        *rt.existing.lock() = names.iter().map(|s| s.to_string()).collect();
        *rt.running.lock() = names.iter().map(|s| s.to_string()).collect();
        rt
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Calls with the given verb, in order.
    pub fn calls_of(&self, verb: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(verb))
            .cloned()
            .collect()
    }

    /// Simulate a container dying outside the reconciler's control.
    pub fn kill(&self, name: &str) {
        self.running.lock().remove(name);
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn start(&self, name: &str, host_port: u16, image: &str) -> Result<RunOutput> {
        self.calls
            .lock()
            .push(format!("start {name} {host_port} {image}"));
        if self.fail_start.lock().contains(name) {
            return Ok(failed_output("simulated start failure"));
        }
        self.running.lock().insert(name.to_string());
        let mut existing = self.existing.lock();
        if !existing.iter().any(|n| n == name) {
            existing.push(name.to_string());
        }
        Ok(ok_output(""))
    }

    async fn stop(&self, name: &str) -> Result<RunOutput> {
        self.calls.lock().push(format!("stop {name}"));
        if self.fail_stop.lock().contains(name) {
            return Ok(failed_output("simulated stop failure"));
        }
        self.running.lock().remove(name);
        Ok(ok_output(""))
    }

    async fn remove(&self, name: &str) -> Result<RunOutput> {
        self.calls.lock().push(format!("remove {name}"));
        self.existing.lock().retain(|n| n != name);
        Ok(ok_output(""))
    }

    async fn inspect(&self, name: &str) -> Result<RunOutput> {
        self.calls.lock().push(format!("inspect {name}"));
        if self.running.lock().contains(name) {
            Ok(ok_output("[{\"State\": {\"Running\": true}}]"))
        } else {
            Ok(ok_output("[{\"State\": {\"Running\": false}}]"))
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.calls.lock().push(format!("list {prefix}"));
        Ok(self
            .existing
            .lock()
            .iter()
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Recording [`Forwarder`] that never touches the network.
#[derive(Default)]
pub struct RecordingForwarder {
    /// `(request id, node id)` per forward, in order.
    pub forwards: Mutex<Vec<(String, String)>>,
    /// When set, every forward fails with an upstream error.
    pub fail: std::sync::atomic::AtomicBool,
}

impl RecordingForwarder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn forwards(&self) -> Vec<(String, String)> {
        self.forwards.lock().clone()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl Forwarder for RecordingForwarder {
    async fn forward(&self, request: &QueuedRequest, node: &NodeHandle) -> Result<ForwardReceipt> {
        self.forwards
            .lock()
            .push((request.id.clone(), node.id.clone()));
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(FileMeshError::Upstream("simulated failure".into()));
        }
        Ok(ForwardReceipt { status: 201 })
    }
}

/// Poll `cond` until it holds or the timeout elapses.
pub async fn wait_until<F>(timeout: std::time::Duration, mut cond: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within {timeout:?}");
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
