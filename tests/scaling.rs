//! Scaling sensor: thresholds, clamping, grace, cool-down.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use filemesh::bus::{BusAdapter, InMemoryBus, ScaleIntent, TOPIC_SCALING_REQUESTS};
use filemesh::queue::{PriorityQueue, QueuedRequest, RequestKind};
use filemesh::registry::NodeRegistry;
use filemesh::scaling::{ScalingSensor, SensorConfig};

fn config() -> SensorConfig {
    SensorConfig {
        tick: Duration::from_millis(10),
        up_threshold: 10,
        per_node_capacity: 5,
        down_grace_ticks: 2,
        // A long cool-down keeps each direction to a single intent per test.
        cooldown: Duration::from_secs(3600),
        max_containers: 4,
        min_containers: 1,
    }
}

async fn recv_intent(rx: &mut tokio::sync::mpsc::Receiver<filemesh::bus::BusMessage>) -> ScaleIntent {
    let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no intent published")
        .expect("bus closed");
    serde_json::from_slice(&msg.payload).unwrap()
}

#[tokio::test(start_paused = true)]
async fn pressure_above_threshold_publishes_a_clamped_scale_up() {
    let queue = Arc::new(PriorityQueue::with_defaults());
    // Depth 23: backlog 13 over the threshold, ceil(13/5) = 3 nodes wanted.
    for i in 0..23 {
        queue
            .offer(QueuedRequest::new(format!("r{i}"), "f", RequestKind::Upload, 0))
            .unwrap();
    }
    let registry = Arc::new(NodeRegistry::new());
    registry.register("n1", "h", 1).unwrap();
    registry.register("n2", "h", 2).unwrap();

    let bus = Arc::new(InMemoryBus::new());
    let mut intents = bus.subscribe(TOPIC_SCALING_REQUESTS).await.unwrap();
    let bus_dyn: Arc<dyn BusAdapter> = bus.clone();

    let cancel = CancellationToken::new();
    let sensor = ScalingSensor::new(queue.clone(), registry.clone(), bus_dyn, config());
    tokio::spawn(sensor.run(cancel.clone()));

    // Wanted 3 but only max - healthy = 4 - 2 = 2 fit.
    let intent = recv_intent(&mut intents).await;
    assert_eq!(intent, ScaleIntent::Up { count: 2, seq: 1 });

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn sustained_empty_queue_publishes_a_single_scale_down() {
    let queue = Arc::new(PriorityQueue::with_defaults());
    let registry = Arc::new(NodeRegistry::new());
    registry.register("n1", "h", 1).unwrap();
    registry.register("n2", "h", 2).unwrap();

    let bus = Arc::new(InMemoryBus::new());
    let mut intents = bus.subscribe(TOPIC_SCALING_REQUESTS).await.unwrap();
    let bus_dyn: Arc<dyn BusAdapter> = bus.clone();

    let cancel = CancellationToken::new();
    let sensor = ScalingSensor::new(queue.clone(), registry.clone(), bus_dyn, config());
    tokio::spawn(sensor.run(cancel.clone()));

    // Two empty ticks satisfy the grace; healthy (2) > min (1).
    let intent = recv_intent(&mut intents).await;
    assert_eq!(intent, ScaleIntent::Down { count: 1, seq: 1 });

    // Cool-down suppresses a second one.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(intents.try_recv().is_err());

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn scale_down_never_undercuts_the_minimum() {
    let queue = Arc::new(PriorityQueue::with_defaults());
    let registry = Arc::new(NodeRegistry::new());
    registry.register("n1", "h", 1).unwrap();

    let bus = Arc::new(InMemoryBus::new());
    let mut intents = bus.subscribe(TOPIC_SCALING_REQUESTS).await.unwrap();
    let bus_dyn: Arc<dyn BusAdapter> = bus.clone();

    let cancel = CancellationToken::new();
    // healthy == min == 1: no scale-down may ever be published.
    let sensor = ScalingSensor::new(queue.clone(), registry.clone(), bus_dyn, config());
    tokio::spawn(sensor.run(cancel.clone()));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(intents.try_recv().is_err());

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn fleet_at_max_suppresses_scale_up() {
    let queue = Arc::new(PriorityQueue::with_defaults());
    for i in 0..50 {
        queue
            .offer(QueuedRequest::new(format!("r{i}"), "f", RequestKind::Upload, 0))
            .unwrap();
    }
    let registry = Arc::new(NodeRegistry::new());
    for i in 1..=4 {
        registry.register(&format!("n{i}"), "h", i).unwrap();
    }

    let bus = Arc::new(InMemoryBus::new());
    let mut intents = bus.subscribe(TOPIC_SCALING_REQUESTS).await.unwrap();
    let bus_dyn: Arc<dyn BusAdapter> = bus.clone();

    let cancel = CancellationToken::new();
    let sensor = ScalingSensor::new(queue.clone(), registry.clone(), bus_dyn, config());
    tokio::spawn(sensor.run(cancel.clone()));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(intents.try_recv().is_err(), "no room above max_containers");

    cancel.cancel();
}
