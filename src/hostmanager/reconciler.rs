//! Async driver closing the scaling loop.
//!
//! One task owns the reconciler state. Bus intents and the periodic tick
//! are handled serially in the same loop, so there is no interleaving
//! between a callback and a reconcile pass. All runtime calls are fallible;
//! a single failure never takes the loop down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::state::{
    parse_index, InspectOutcome, IntentOutcome, ReconcilerState, RetryOutcome,
};
use crate::bus::{
    BusAdapter, ScaleAction, ScaleEvent, ScaleIntent, TOPIC_HOSTMANAGER_EVENTS,
    TOPIC_SCALING_REQUESTS,
};
use crate::error::Result;
use crate::runtime::{inspect_reports_running, ContainerRuntime};
use crate::settings::HostManagerSettings;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// The host-manager reconciler.
pub struct Reconciler {
    state: ReconcilerState,
    runtime: Arc<dyn ContainerRuntime>,
    bus: Arc<dyn BusAdapter>,
    image: String,
    prefix: String,
    tick: Duration,
    backoff: HashMap<u32, Instant>,
}

impl Reconciler {
    /// Assemble a reconciler from settings and its two seams.
    pub fn new(
        settings: &HostManagerSettings,
        runtime: Arc<dyn ContainerRuntime>,
        bus: Arc<dyn BusAdapter>,
    ) -> Self {
        let state = ReconcilerState::new(
            settings.min_containers,
            settings.max_containers,
            settings.container_prefix.clone(),
            settings.base_container_port,
            settings.unhealthy_reset_ticks,
        );
        Reconciler {
            state,
            runtime,
            bus,
            image: settings.container_image.clone(),
            prefix: settings.container_prefix.clone(),
            tick: Duration::from_millis(settings.reconcile_tick_ms),
            backoff: HashMap::new(),
        }
    }

    /// Read-only view of the state, for tests and status reporting.
    pub fn state(&self) -> &ReconcilerState {
        &self.state
    }

    /// Rebuild `Observed` from what the runtime actually has, then top the
    /// fleet up to the configured minimum.
    pub async fn bootstrap(&mut self) -> Result<()> {
        let names = self.runtime.list(&self.prefix).await?;
        let mut indices = Vec::new();
        for name in &names {
            match parse_index(&self.prefix, name) {
                Some(index) => indices.push(index),
                None => warn!(container = %name, "ignoring container outside the identity namespace"),
            }
        }
        let requested = self.state.bootstrap(&indices);
        info!(
            adopted = indices.len(),
            requested = requested.len(),
            "reconciler bootstrapped from runtime"
        );
        Ok(())
    }

    /// Run until cancelled. Returns early only if the bus subscription
    /// cannot be established.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let mut intents = self.bus.subscribe(TOPIC_SCALING_REQUESTS).await?;
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(tick_ms = self.tick.as_millis() as u64, "reconciler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("reconciler stopped");
                    return Ok(());
                }
                msg = intents.recv() => {
                    match msg {
                        Some(msg) => self.handle_intent_payload(&msg.payload),
                        None => {
                            error!("intent subscription closed, reconciler exiting");
                            return Ok(());
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.reconcile_tick().await;
                }
            }
        }
    }

    fn handle_intent_payload(&mut self, payload: &[u8]) {
        match serde_json::from_slice::<ScaleIntent>(payload) {
            Ok(intent) => self.apply_intent(intent),
            Err(err) => warn!(error = %err, "ignoring malformed scale intent"),
        }
    }

    /// Apply one scale intent to the desired set. Bounds are enforced here;
    /// the runtime work happens on the next reconcile tick.
    pub fn apply_intent(&mut self, intent: ScaleIntent) {
        match self.state.apply(intent) {
            IntentOutcome::Duplicate => {
                debug!(seq = intent.seq(), "replayed intent ignored");
            }
            IntentOutcome::NoCapacity => {
                info!(
                    action = intent.action(),
                    seq = intent.seq(),
                    active = self.state.active_count(),
                    "intent accepted but fleet bounds leave nothing to do"
                );
            }
            IntentOutcome::ScaledUp(added) => {
                info!(seq = intent.seq(), containers = ?added, "scale-up accepted");
            }
            IntentOutcome::ScalingDown(victims) => {
                info!(seq = intent.seq(), containers = ?victims, "scale-down accepted");
            }
        }
    }

    /// One reconcile pass: start what is requested, stop what is stopping,
    /// inspect what should be up.
    pub async fn reconcile_tick(&mut self) {
        let plan = self.state.tick_plan();
        let now = Instant::now();

        for (index, _attempts) in plan.start {
            if self.backoff.get(&index).is_some_and(|t| *t > now) {
                continue;
            }
            self.start_container(index).await;
        }
        for index in plan.stop {
            self.stop_container(index).await;
        }
        for index in plan.inspect {
            self.inspect_container(index).await;
        }
    }

    async fn start_container(&mut self, index: u32) {
        let name = self.state.name(index);
        let port = self.state.port(index);
        match self.runtime.start(&name, port, &self.image).await {
            Ok(out) if out.success() => {
                self.backoff.remove(&index);
                if self.state.on_start_success(index) {
                    info!(container = %name, port, "container started");
                    self.publish_event(ScaleAction::Up, &name).await;
                }
            }
            Ok(out) => {
                self.record_start_failure(index, &name, out.stderr.trim());
            }
            Err(err) => {
                self.record_start_failure(index, &name, &err.to_string());
            }
        }
    }

    fn record_start_failure(&mut self, index: u32, name: &str, detail: &str) {
        match self.state.on_start_failure(index) {
            RetryOutcome::Retry(attempts) => {
                let delay = backoff_delay(attempts);
                self.backoff.insert(index, Instant::now() + delay);
                warn!(container = %name, attempts, ?delay, detail, "container start failed, will retry");
            }
            RetryOutcome::GaveUp => {
                self.backoff.remove(&index);
                error!(container = %name, detail, "container start failed repeatedly, giving up");
            }
        }
    }

    async fn stop_container(&mut self, index: u32) {
        let name = self.state.name(index);
        match self.runtime.stop(&name).await {
            Ok(out) if out.success() => {
                if self.state.on_stop_success(index) {
                    info!(container = %name, "container stopped");
                    self.publish_event(ScaleAction::Down, &name).await;
                }
                // Best-effort cleanup; a failure leaves a stopped container
                // behind, which list() will surface on the next bootstrap.
                if let Err(err) = self.runtime.remove(&name).await {
                    debug!(container = %name, error = %err, "container remove failed");
                }
            }
            Ok(out) => self.record_stop_failure(index, &name, out.stderr.trim()),
            Err(err) => self.record_stop_failure(index, &name, &err.to_string()),
        }
    }

    fn record_stop_failure(&mut self, index: u32, name: &str, detail: &str) {
        match self.state.on_stop_failure(index) {
            RetryOutcome::Retry(attempts) => {
                warn!(container = %name, attempts, detail, "container stop failed, will retry");
            }
            RetryOutcome::GaveUp => {
                error!(container = %name, detail, "container stop failed repeatedly, untracking");
            }
        }
    }

    async fn inspect_container(&mut self, index: u32) {
        let name = self.state.name(index);
        let running = match self.runtime.inspect(&name).await {
            Ok(out) => inspect_reports_running(&out),
            Err(err) => {
                warn!(container = %name, error = %err, "inspect failed");
                false
            }
        };
        match self.state.on_inspect(index, running) {
            InspectOutcome::BecameRunning => {
                info!(container = %name, "container confirmed running");
            }
            InspectOutcome::Degraded(failed) => {
                warn!(container = %name, failed_inspects = failed, "container unhealthy");
            }
            InspectOutcome::Restart => {
                warn!(container = %name, "container unhealthy past reset bound, scheduling restart");
            }
            InspectOutcome::StillStarting
            | InspectOutcome::Healthy
            | InspectOutcome::Untracked => {}
        }
    }

    async fn publish_event(&self, action: ScaleAction, container: &str) {
        let event = ScaleEvent::now(action, container);
        let payload = match serde_json::to_vec(&event) {
            Ok(p) => p,
            Err(err) => {
                warn!(error = %err, "scale event serialization failed");
                return;
            }
        };
        if let Err(err) = self.bus.publish(TOPIC_HOSTMANAGER_EVENTS, payload).await {
            warn!(error = %err, container, "scale event dropped, bus unavailable");
        }
    }
}

fn backoff_delay(attempts: u32) -> Duration {
    let exp = BACKOFF_BASE * 2u32.saturating_pow(attempts.saturating_sub(1));
    exp.min(BACKOFF_CAP)
}
