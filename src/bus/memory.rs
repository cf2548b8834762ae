//! In-process bus for tests and single-process deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{BusAdapter, BusMessage};
use crate::error::Result;

const CHANNEL_DEPTH: usize = 64;

/// Loopback [`BusAdapter`]: publishes fan out to every live subscriber of
/// the exact topic. Slow subscribers lose messages rather than block the
/// publisher, matching the at-most-once contract of the real bus.
#[derive(Default)]
pub struct InMemoryBus {
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<BusMessage>>>>,
}

impl InMemoryBus {
    /// Empty bus.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BusAdapter for InMemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let payload = Bytes::from(payload);
        let mut subs = self.subscribers.lock();
        if let Some(senders) = subs.get_mut(topic) {
            senders.retain(|tx| {
                let msg = BusMessage {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                };
                match tx.try_send(msg) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(topic, "in-memory bus subscriber lagging, message dropped");
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            });
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BusMessage>> {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        self.subscribers
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
