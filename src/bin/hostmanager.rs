//! FileMesh host manager.
//!
//! Subscribes to scale intents on the bus, reconciles the desired container
//! fleet against what the runtime reports, and republishes completion
//! events for downstream subscribers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use filemesh::bus::{BusAdapter, MqttBus};
use filemesh::hostmanager::Reconciler;
use filemesh::runtime::{ContainerRuntime, ProcessRuntime};
use filemesh::settings::HostManagerSettings;

/// FileMesh elastic-scaling host manager.
#[derive(Parser)]
#[command(name = "filemesh-hostmanager", version, about)]
struct Cli {}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let _cli = Cli::parse();
    let settings = HostManagerSettings::from_env().context("loading configuration")?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_cancel.cancel();
        }
    });

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(ProcessRuntime::new(
        settings.container_runtime_bin.clone(),
        settings.container_internal_port,
    ));

    let client_id = format!("filemesh-hostmanager-{}", uuid::Uuid::new_v4().simple());
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
    let bus: Arc<dyn BusAdapter> = bus;

    let mut reconciler = Reconciler::new(&settings, runtime, bus);
    reconciler
        .bootstrap()
        .await
        .context("rebuilding observed container set")?;

    reconciler.run(cancel).await?;
    info!("shutdown complete");
    Ok(())
}
