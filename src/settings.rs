//! Environment-driven configuration for the two control-plane binaries.
//!
//! Settings are layered: coded defaults first, then the process environment
//! (`SERVER_PORT`, `SCHEDULER_TYPE`, ...). The deserialized structs are
//! validated before anything is constructed from them; a bad value is a
//! fatal init failure, not a runtime surprise.

use std::str::FromStr;
use std::time::Duration;

use config::{Config, Environment};
use serde::Deserialize;

use crate::error::{FileMeshError, Result};

/// Selection policy choices for the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum SchedulerKind {
    /// Dispatch to the least-loaded healthy node.
    Fcfs,
    /// Spread the queue's size-ordered jobs evenly (round-robin).
    Sjn,
    /// Stateful rotation over the healthy set.
    RoundRobin,
}

impl SchedulerKind {
    /// Policy name as reported by `/api/health` and access logs.
    pub fn name(&self) -> &'static str {
        match self {
            SchedulerKind::Fcfs => "FCFS",
            SchedulerKind::Sjn => "SJN",
            SchedulerKind::RoundRobin => "ROUNDROBIN",
        }
    }
}

impl FromStr for SchedulerKind {
    type Err = FileMeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FCFS" => Ok(SchedulerKind::Fcfs),
            "SJN" => Ok(SchedulerKind::Sjn),
            "ROUNDROBIN" => Ok(SchedulerKind::RoundRobin),
            other => Err(FileMeshError::ConfigInvalid(format!(
                "unknown SCHEDULER_TYPE '{other}' (expected FCFS, SJN or ROUNDROBIN)"
            ))),
        }
    }
}

impl TryFrom<String> for SchedulerKind {
    type Error = FileMeshError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// A backend node endpoint parsed from `STORAGE_NODES`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    /// Hostname or address of the aggregator node.
    pub host: String,
    /// HTTP port of the aggregator node.
    pub port: u16,
}

impl NodeSpec {
    /// Stable node id used by the registry: `host:port`.
    pub fn id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeSpec {
    type Err = FileMeshError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s.rsplit_once(':').ok_or_else(|| {
            FileMeshError::ConfigInvalid(format!("storage node '{s}' is not host:port"))
        })?;
        if host.is_empty() {
            return Err(FileMeshError::ConfigInvalid(format!(
                "storage node '{s}' has an empty host"
            )));
        }
        let port = port.parse::<u16>().map_err(|_| {
            FileMeshError::ConfigInvalid(format!("storage node '{s}' has a bad port"))
        })?;
        Ok(NodeSpec {
            host: host.to_string(),
            port,
        })
    }
}

/// Settings for the `filemesh-lb` binary.
#[derive(Debug, Clone, Deserialize)]
pub struct LbSettings {
    /// Public HTTP listen port.
    pub server_port: u16,
    /// Selection policy for the worker pool.
    pub scheduler_type: SchedulerKind,
    /// Lower bound of the admission delay, milliseconds.
    pub lb_delay_ms_min: u64,
    /// Upper bound of the admission delay, milliseconds.
    pub lb_delay_ms_max: u64,
    /// Number of concurrent forwarding workers.
    pub thread_pool_size: usize,
    /// Health probe period, milliseconds.
    pub probe_interval_ms: u64,
    /// Per-probe TCP connect timeout, milliseconds.
    pub probe_timeout_ms: u64,
    /// Comma-separated `host:port` list seeding the registry.
    pub storage_nodes: String,
    /// MQTT broker hostname.
    pub mqtt_broker_host: String,
    /// MQTT broker port.
    pub mqtt_broker_port: u16,
    /// Upload size bound in bytes.
    pub max_file_size: u64,
    /// Queue capacity; 0 means unbounded.
    pub queue_capacity: usize,
    /// Aging coefficient of the queue score.
    pub age_factor: f64,
    /// Size-penalty coefficient of the queue score.
    pub size_factor: f64,
    /// Re-enqueue instead of dropping when no node is healthy.
    pub lb_requeue_on_no_nodes: bool,
    /// Drop queued entries older than this at dequeue; 0 disables.
    pub lb_queue_ttl_ms: u64,
    /// Bounded drain time on shutdown, milliseconds.
    pub lb_shutdown_grace_ms: u64,
    /// Fail startup if the bus is unreachable.
    pub lb_strict_bus: bool,
    /// Scaling sensor period, milliseconds.
    pub scale_tick_ms: u64,
    /// Queue depth above which the sensor publishes scale-up intents.
    pub scale_up_threshold: usize,
    /// Requests one backend node is assumed to absorb.
    pub scale_per_node_capacity: usize,
    /// Consecutive empty ticks before a scale-down intent.
    pub scale_down_grace_ticks: u32,
    /// Minimum gap between same-direction intents, milliseconds.
    pub scale_cooldown_ms: u64,
    /// Upper bound of the container fleet (shared with the host manager).
    pub max_containers: u32,
    /// Lower bound of the container fleet (shared with the host manager).
    pub min_containers: u32,
}

impl LbSettings {
    /// Load settings from defaults overridden by the environment.
    pub fn from_env() -> Result<Self> {
        let cfg = Config::builder()
            .set_default("server_port", 6869_i64)?
            .set_default("scheduler_type", "ROUNDROBIN")?
            .set_default("lb_delay_ms_min", 1000_i64)?
            .set_default("lb_delay_ms_max", 5000_i64)?
            .set_default("thread_pool_size", 10_i64)?
            .set_default("probe_interval_ms", 5000_i64)?
            .set_default("probe_timeout_ms", 3000_i64)?
            .set_default("storage_nodes", "")?
            .set_default("mqtt_broker_host", "mqtt-broker")?
            .set_default("mqtt_broker_port", 1883_i64)?
            .set_default("max_file_size", 5_368_709_120_i64)?
            .set_default("queue_capacity", 0_i64)?
            .set_default("age_factor", 0.1_f64)?
            .set_default("size_factor", 1.0_f64)?
            .set_default("lb_requeue_on_no_nodes", false)?
            .set_default("lb_queue_ttl_ms", 0_i64)?
            .set_default("lb_shutdown_grace_ms", 5000_i64)?
            .set_default("lb_strict_bus", false)?
            .set_default("scale_tick_ms", 10_000_i64)?
            .set_default("scale_up_threshold", 10_i64)?
            .set_default("scale_per_node_capacity", 5_i64)?
            .set_default("scale_down_grace_ticks", 3_i64)?
            .set_default("scale_cooldown_ms", 30_000_i64)?
            .set_default("max_containers", 4_i64)?
            .set_default("min_containers", 1_i64)?
            .add_source(Environment::default().try_parsing(true))
            .build()?;
        let settings: LbSettings = cfg.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parsed `STORAGE_NODES` list; an empty value yields an empty registry.
    pub fn nodes(&self) -> Result<Vec<NodeSpec>> {
        self.storage_nodes
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(NodeSpec::from_str)
            .collect()
    }

    /// Admission delay bounds as durations.
    pub fn admission_delay(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.lb_delay_ms_min),
            Duration::from_millis(self.lb_delay_ms_max),
        )
    }

    /// Optional queue TTL.
    pub fn queue_ttl(&self) -> Option<Duration> {
        (self.lb_queue_ttl_ms > 0).then(|| Duration::from_millis(self.lb_queue_ttl_ms))
    }

    /// Optional queue capacity.
    pub fn queue_bound(&self) -> Option<usize> {
        (self.queue_capacity > 0).then_some(self.queue_capacity)
    }

    fn validate(&self) -> Result<()> {
        if self.lb_delay_ms_max < self.lb_delay_ms_min {
            return Err(FileMeshError::ConfigInvalid(format!(
                "LB_DELAY_MS_MAX ({}) must be >= LB_DELAY_MS_MIN ({})",
                self.lb_delay_ms_max, self.lb_delay_ms_min
            )));
        }
        if self.probe_interval_ms < self.probe_timeout_ms {
            return Err(FileMeshError::ConfigInvalid(format!(
                "PROBE_INTERVAL_MS ({}) must be >= PROBE_TIMEOUT_MS ({})",
                self.probe_interval_ms, self.probe_timeout_ms
            )));
        }
        if self.thread_pool_size == 0 {
            return Err(FileMeshError::ConfigInvalid(
                "THREAD_POOL_SIZE must be at least 1".into(),
            ));
        }
        if self.min_containers < 1 || self.max_containers < self.min_containers {
            return Err(FileMeshError::ConfigInvalid(format!(
                "container bounds [{}, {}] are invalid (MIN >= 1, MAX >= MIN)",
                self.min_containers, self.max_containers
            )));
        }
        if self.scale_per_node_capacity == 0 {
            return Err(FileMeshError::ConfigInvalid(
                "SCALE_PER_NODE_CAPACITY must be at least 1".into(),
            ));
        }
        self.nodes()?;
        Ok(())
    }
}

/// Settings for the `filemesh-hostmanager` binary.
#[derive(Debug, Clone, Deserialize)]
pub struct HostManagerSettings {
    /// MQTT broker hostname.
    pub mqtt_broker_host: String,
    /// MQTT broker port.
    pub mqtt_broker_port: u16,
    /// Upper bound of the container fleet.
    pub max_containers: u32,
    /// Lower bound of the container fleet.
    pub min_containers: u32,
    /// Identity namespace prefix: container `i` is named `<prefix><i>`.
    pub container_prefix: String,
    /// Host port of container 1; container `i` gets `base + i - 1`.
    pub base_container_port: u16,
    /// Image handed to the runtime adapter on start.
    pub container_image: String,
    /// Port the image listens on inside the container.
    pub container_internal_port: u16,
    /// CLI binary the runtime adapter shells out to.
    pub container_runtime_bin: String,
    /// Reconcile period, milliseconds.
    pub reconcile_tick_ms: u64,
    /// Consecutive failed inspects before a running container is restarted.
    pub unhealthy_reset_ticks: u32,
    /// Fail startup if the bus is unreachable.
    pub lb_strict_bus: bool,
}

impl HostManagerSettings {
    /// Load settings from defaults overridden by the environment.
    pub fn from_env() -> Result<Self> {
        let cfg = Config::builder()
            .set_default("mqtt_broker_host", "mqtt-broker")?
            .set_default("mqtt_broker_port", 1883_i64)?
            .set_default("max_containers", 4_i64)?
            .set_default("min_containers", 1_i64)?
            .set_default("container_prefix", "soft40051-files-container")?
            .set_default("base_container_port", 4848_i64)?
            .set_default("container_image", "filemesh/aggregator:latest")?
            .set_default("container_internal_port", 4848_i64)?
            .set_default("container_runtime_bin", "docker")?
            .set_default("reconcile_tick_ms", 10_000_i64)?
            .set_default("unhealthy_reset_ticks", 3_i64)?
            .set_default("lb_strict_bus", false)?
            .add_source(Environment::default().try_parsing(true))
            .build()?;
        let settings: HostManagerSettings = cfg.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.min_containers < 1 || self.max_containers < self.min_containers {
            return Err(FileMeshError::ConfigInvalid(format!(
                "container bounds [{}, {}] are invalid (MIN >= 1, MAX >= MIN)",
                self.min_containers, self.max_containers
            )));
        }
        if self.container_prefix.is_empty() {
            return Err(FileMeshError::ConfigInvalid(
                "CONTAINER_PREFIX must not be empty".into(),
            ));
        }
        if self.unhealthy_reset_ticks == 0 {
            return Err(FileMeshError::ConfigInvalid(
                "UNHEALTHY_RESET_TICKS must be at least 1".into(),
            ));
        }
        let top = u32::from(self.base_container_port) + self.max_containers - 1;
        if top > u32::from(u16::MAX) {
            return Err(FileMeshError::ConfigInvalid(format!(
                "BASE_CONTAINER_PORT {} + MAX_CONTAINERS {} exceeds the port range",
                self.base_container_port, self.max_containers
            )));
        }
        Ok(())
    }
}
