//! Host manager: the engine that closes the elastic-scaling loop.
//!
//! Split into a pure state machine ([`state`]) and an async driver
//! ([`reconciler`]). The driver consumes scale intents from the bus,
//! reconciles desired against observed containers each tick through the
//! runtime adapter, and republishes completion events.

pub mod reconciler;
pub mod state;

pub use reconciler::Reconciler;
pub use state::{
    container_name, container_port, parse_index, InspectOutcome, IntentOutcome, Lifecycle,
    ReconcilerState, RetryOutcome, TickPlan, MAX_START_ATTEMPTS, MAX_STOP_ATTEMPTS,
};
