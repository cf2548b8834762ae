//! Message-bus seam.
//!
//! Components publish and subscribe through [`BusAdapter`] and never touch
//! the transport directly. [`MqttBus`] is the deployment implementation;
//! [`InMemoryBus`] serves tests and single-process setups. Both are safe to
//! share: the MQTT client runs behind a single pump task (a mailbox), the
//! in-memory bus behind a plain lock.

mod memory;
mod messages;
mod mqtt;

pub use memory::InMemoryBus;
pub use messages::{
    ScaleAction, ScaleEvent, ScaleIntent, TOPIC_HOSTMANAGER_EVENTS, TOPIC_SCALING_REQUESTS,
};
pub use mqtt::MqttBus;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;

/// A message delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Topic the message arrived on.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Bytes,
}

/// Publish/subscribe transport used by the sensor and the reconciler.
#[async_trait]
pub trait BusAdapter: Send + Sync {
    /// Publish `payload` on `topic`. At-most-once from the caller's view:
    /// an error means the message was dropped.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Subscribe to `topic`; messages arrive on the returned channel until
    /// the receiver is dropped.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BusMessage>>;
}
