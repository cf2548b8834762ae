//! FileMesh load balancer server.
//!
//! Wires the public HTTP API, the priority queue, the health probe, the
//! worker pool, and the scaling sensor together. All mutable state is
//! owned here at the process root and handed down as parameters; there are
//! no process-wide singletons.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use filemesh::api::{self, AppState, FileIndex};
use filemesh::bus::{BusAdapter, MqttBus};
use filemesh::health::HealthProbe;
use filemesh::queue::PriorityQueue;
use filemesh::registry::NodeRegistry;
use filemesh::scaling::{ScalingSensor, SensorConfig};
use filemesh::scheduler::build_policy;
use filemesh::settings::LbSettings;
use filemesh::stats::LbStats;
use filemesh::worker::{HttpForwarder, WorkerConfig, WorkerPool};

/// FileMesh request-routing load balancer.
#[derive(Parser)]
#[command(name = "filemesh-lb", version, about)]
struct Cli {
    /// Override the public listen port (`SERVER_PORT`).
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut settings = LbSettings::from_env().context("loading configuration")?;
    if let Some(port) = cli.port {
        settings.server_port = port;
    }

    let cancel = CancellationToken::new();

    // Registry seeded from STORAGE_NODES; scaling events add the rest.
    let registry = Arc::new(NodeRegistry::new());
    for spec in settings.nodes()? {
        registry.register(&spec.id(), &spec.host, spec.port)?;
    }
    info!(nodes = registry.len(), "registry seeded");

    let queue = Arc::new(PriorityQueue::new(
        settings.queue_bound(),
        settings.age_factor,
        settings.size_factor,
    ));
    let stats = Arc::new(LbStats::default());
    let files = Arc::new(FileIndex::new());

    let client_id = format!("filemesh-lb-{}", uuid::Uuid::new_v4().simple());
    let bus = Arc::new(MqttBus::connect(
        settings.mqtt_broker_host.clone(),
        settings.mqtt_broker_port,
        client_id,
        cancel.child_token(),
    ));
    if settings.lb_strict_bus {
        bus.wait_connected(Duration::from_secs(5))
            .await
            .context("message bus unreachable at start")?;
    }

    let probe = HealthProbe::new(
        registry.clone(),
        Duration::from_millis(settings.probe_interval_ms),
        Duration::from_millis(settings.probe_timeout_ms),
    )?;
    tokio::spawn(probe.run(cancel.child_token()));

    let (delay_min, delay_max) = settings.admission_delay();
    let pool = WorkerPool::new(
        queue.clone(),
        registry.clone(),
        build_policy(settings.scheduler_type),
        Arc::new(HttpForwarder::new()?),
        stats.clone(),
        WorkerConfig {
            workers: settings.thread_pool_size,
            delay_min,
            delay_max,
            requeue_on_no_nodes: settings.lb_requeue_on_no_nodes,
            queue_ttl: settings.queue_ttl(),
        },
    );
    let workers = pool.start(cancel.child_token());

    let sensor_bus: Arc<dyn BusAdapter> = bus.clone();
    let sensor = ScalingSensor::new(
        queue.clone(),
        registry.clone(),
        sensor_bus,
        SensorConfig {
            tick: Duration::from_millis(settings.scale_tick_ms),
            up_threshold: settings.scale_up_threshold,
            per_node_capacity: settings.scale_per_node_capacity,
            down_grace_ticks: settings.scale_down_grace_ticks,
            cooldown: Duration::from_millis(settings.scale_cooldown_ms),
            max_containers: settings.max_containers,
            min_containers: settings.min_containers,
        },
    );
    tokio::spawn(sensor.run(cancel.child_token()));

    let state = AppState {
        queue,
        registry,
        files,
        stats,
        scheduler: settings.scheduler_type.name(),
        max_file_size: settings.max_file_size,
        started: Instant::now(),
    };
    let app = api::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.server_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding public API on {addr}"))?;
    info!(%addr, scheduler = settings.scheduler_type.name(), "public API listening");

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_cancel.cancel();
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await
        .context("serving public API")?;

    // Drain in-flight forwards up to the grace bound, then abort.
    cancel.cancel();
    workers
        .join(Duration::from_millis(settings.lb_shutdown_grace_ms))
        .await;
    info!("shutdown complete");
    Ok(())
}
