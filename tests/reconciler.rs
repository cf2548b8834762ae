//! Host-manager reconciler: gap filling, floors, idempotency, restarts.

mod common;

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

use common::{wait_until, MockRuntime};
use filemesh::bus::{
    BusAdapter, InMemoryBus, ScaleEvent, ScaleIntent, TOPIC_HOSTMANAGER_EVENTS,
    TOPIC_SCALING_REQUESTS,
};
use filemesh::hostmanager::{Lifecycle, Reconciler, ReconcilerState};
use filemesh::settings::HostManagerSettings;

fn settings(min: u32, max: u32) -> HostManagerSettings {
    HostManagerSettings {
        mqtt_broker_host: "unused".into(),
        mqtt_broker_port: 1883,
        max_containers: max,
        min_containers: min,
        container_prefix: "c".into(),
        base_container_port: 4848,
        container_image: "img".into(),
        container_internal_port: 4848,
        container_runtime_bin: "docker".into(),
        reconcile_tick_ms: 10,
        unhealthy_reset_ticks: 3,
        lb_strict_bus: false,
    }
}

struct Rig {
    runtime: Arc<MockRuntime>,
    bus: Arc<InMemoryBus>,
    reconciler: Reconciler,
}

async fn rig(min: u32, max: u32, existing: &[&str]) -> Rig {
    let runtime = Arc::new(MockRuntime::with_existing(existing));
    let bus = Arc::new(InMemoryBus::new());
    let bus_dyn: Arc<dyn BusAdapter> = bus.clone();
    let mut reconciler = Reconciler::new(&settings(min, max), runtime.clone(), bus_dyn);
    reconciler.bootstrap().await.unwrap();
    Rig {
        runtime,
        bus,
        reconciler,
    }
}

fn up(count: u32, seq: u64) -> ScaleIntent {
    ScaleIntent::Up { count, seq }
}

fn down(count: u32, seq: u64) -> ScaleIntent {
    ScaleIntent::Down { count, seq }
}

#[tokio::test]
async fn scale_up_fills_the_lowest_gap() {
    // Desired {c1, c3}: the next scale-up must create c2 on port 4849,
    // and exactly once.
    let mut rig = rig(1, 4, &["c1", "c3"]).await;
    let mut events = rig.bus.subscribe(TOPIC_HOSTMANAGER_EVENTS).await.unwrap();

    rig.reconciler.apply_intent(up(1, 42));
    rig.reconciler.reconcile_tick().await;
    assert_eq!(rig.runtime.calls_of("start"), vec!["start c2 4849 img"]);
    assert_eq!(
        rig.reconciler.state().lifecycle(2),
        Some(Lifecycle::Starting)
    );

    // The next tick's inspect confirms it; no second start happens.
    rig.reconciler.reconcile_tick().await;
    assert_eq!(rig.runtime.calls_of("start").len(), 1);
    assert_eq!(
        rig.reconciler.state().lifecycle(2),
        Some(Lifecycle::Running { failed_inspects: 0 })
    );

    let event: ScaleEvent = serde_json::from_slice(&events.recv().await.unwrap().payload).unwrap();
    assert_eq!(event.container, "c2");
    assert_eq!(serde_json::to_value(event.action).unwrap(), "up");
}

#[tokio::test]
async fn scale_down_stops_highest_first_and_respects_the_floor() {
    let mut rig = rig(1, 4, &["c1", "c2", "c3", "c4"]).await;
    let mut events = rig.bus.subscribe(TOPIC_HOSTMANAGER_EVENTS).await.unwrap();

    rig.reconciler.apply_intent(down(2, 1));
    rig.reconciler.reconcile_tick().await;
    assert_eq!(rig.runtime.calls_of("stop"), vec!["stop c4", "stop c3"]);
    assert_eq!(rig.reconciler.state().tracked(), vec![1, 2]);

    // Over-asking only drains down to the floor.
    rig.reconciler.apply_intent(down(5, 2));
    rig.reconciler.reconcile_tick().await;
    assert_eq!(
        rig.runtime.calls_of("stop"),
        vec!["stop c4", "stop c3", "stop c2"]
    );
    assert_eq!(rig.reconciler.state().tracked(), vec![1]);
    assert_eq!(rig.reconciler.state().active_count(), 1);

    for expected in ["c4", "c3", "c2"] {
        let event: ScaleEvent =
            serde_json::from_slice(&events.recv().await.unwrap().payload).unwrap();
        assert_eq!(event.container, expected);
        assert_eq!(serde_json::to_value(event.action).unwrap(), "down");
    }
}

#[tokio::test]
async fn replayed_intent_seq_is_a_no_op() {
    let mut rig = rig(1, 4, &["c1"]).await;
    rig.reconciler.apply_intent(up(1, 7));
    rig.reconciler.apply_intent(up(1, 7));
    rig.reconciler.reconcile_tick().await;

    assert_eq!(rig.runtime.calls_of("start"), vec!["start c2 4849 img"]);
    assert_eq!(rig.reconciler.state().tracked(), vec![1, 2]);
}

#[tokio::test]
async fn min_equals_max_makes_intents_no_ops() {
    let mut rig = rig(2, 2, &["c1", "c2"]).await;
    rig.reconciler.apply_intent(up(3, 1));
    rig.reconciler.apply_intent(down(1, 2));
    rig.reconciler.reconcile_tick().await;

    assert!(rig.runtime.calls_of("start").is_empty());
    assert!(rig.runtime.calls_of("stop").is_empty());
    assert_eq!(rig.reconciler.state().active_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn start_failures_back_off_then_give_up() {
    let rt = MockRuntime::new();
    rt.fail_start.lock().insert("c1".to_string());
    let runtime = Arc::new(rt);
    let bus: Arc<dyn BusAdapter> = Arc::new(InMemoryBus::new());
    let mut reconciler = Reconciler::new(&settings(1, 4), runtime.clone(), bus);
    reconciler.bootstrap().await.unwrap();

    // Attempt 1, then backoff gates the retries.
    reconciler.reconcile_tick().await;
    assert_eq!(runtime.calls_of("start").len(), 1);
    reconciler.reconcile_tick().await;
    assert_eq!(runtime.calls_of("start").len(), 1, "retry must wait for backoff");

    tokio::time::advance(Duration::from_secs(2)).await;
    reconciler.reconcile_tick().await;
    assert_eq!(runtime.calls_of("start").len(), 2);

    tokio::time::advance(Duration::from_secs(3)).await;
    reconciler.reconcile_tick().await;
    assert_eq!(runtime.calls_of("start").len(), 3);

    // Budget exhausted: the entry is gone and no further starts happen.
    assert_eq!(reconciler.state().lifecycle(1), None);
    tokio::time::advance(Duration::from_secs(10)).await;
    reconciler.reconcile_tick().await;
    assert_eq!(runtime.calls_of("start").len(), 3);
}

#[tokio::test]
async fn unhealthy_running_container_is_restarted() {
    let mut rig = rig(1, 4, &["c1"]).await;
    rig.reconciler.reconcile_tick().await;
    assert_eq!(
        rig.reconciler.state().lifecycle(1),
        Some(Lifecycle::Running { failed_inspects: 0 })
    );

    // Three consecutive failed inspects trip the restart.
    rig.runtime.kill("c1");
    for _ in 0..3 {
        rig.reconciler.reconcile_tick().await;
    }
    assert_eq!(
        rig.reconciler.state().lifecycle(1),
        Some(Lifecycle::Requested { attempts: 0 })
    );

    rig.reconciler.reconcile_tick().await;
    assert_eq!(rig.runtime.calls_of("start"), vec!["start c1 4848 img"]);
    rig.reconciler.reconcile_tick().await;
    assert_eq!(
        rig.reconciler.state().lifecycle(1),
        Some(Lifecycle::Running { failed_inspects: 0 })
    );
}

#[tokio::test]
async fn bootstrap_tops_the_fleet_up_to_min() {
    let mut rig = rig(2, 4, &[]).await;
    rig.reconciler.reconcile_tick().await;
    assert_eq!(
        rig.runtime.calls_of("start"),
        vec!["start c1 4848 img", "start c2 4849 img"]
    );
}

#[tokio::test]
async fn intents_flow_through_the_bus() {
    let runtime = Arc::new(MockRuntime::with_existing(&["c1"]));
    let bus = Arc::new(InMemoryBus::new());
    let bus_dyn: Arc<dyn BusAdapter> = bus.clone();
    let mut reconciler = Reconciler::new(&settings(1, 4), runtime.clone(), bus_dyn);
    reconciler.bootstrap().await.unwrap();

    let cancel = CancellationToken::new();
    let driver = tokio::spawn(reconciler.run(cancel.clone()));

    // Give the driver a moment to subscribe, then publish a real intent.
    tokio::time::sleep(Duration::from_millis(50)).await;
    bus.publish(
        TOPIC_SCALING_REQUESTS,
        serde_json::to_vec(&up(1, 99)).unwrap(),
    )
    .await
    .unwrap();

    wait_until(Duration::from_secs(5), || {
        runtime.calls_of("start") == vec!["start c2 4849 img"]
    })
    .await;

    cancel.cancel();
    driver.await.unwrap().unwrap();
}

proptest! {
    /// For any intent sequence applied to a bootstrapped state, the active
    /// fleet size stays within `[min, max]` after every intent.
    #[test]
    fn fleet_bounds_hold_under_any_intent_sequence(
        (min, max) in (1u32..4).prop_flat_map(|min| (Just(min), min..8)),
        intents in prop::collection::vec((any::<bool>(), 1u32..6), 0..40),
    ) {
        let mut state = ReconcilerState::new(min, max, "c", 4848, 3);
        state.bootstrap(&[]);
        prop_assert!(state.active_count() >= min && state.active_count() <= max);

        for (seq, (is_up, count)) in intents.into_iter().enumerate() {
            let intent = if is_up {
                ScaleIntent::Up { count, seq: seq as u64 }
            } else {
                ScaleIntent::Down { count, seq: seq as u64 }
            };
            let outcome = state.apply(intent);
            // Complete pending stops so later intents see a settled fleet.
            if let filemesh::hostmanager::IntentOutcome::ScalingDown(victims) = outcome {
                for v in victims {
                    state.on_stop_success(v);
                }
            }
            prop_assert!(
                state.active_count() >= min && state.active_count() <= max,
                "active {} outside [{}, {}]",
                state.active_count(),
                min,
                max
            );
        }
    }
}
