//! MQTT-backed bus adapter.
//!
//! One broker connection per process. The rumqttc event loop is pumped by a
//! dedicated task that owns all incoming traffic and fans publishes out to
//! subscriber channels, so callers never contend on the transport. On
//! reconnect the pump re-issues every active subscription.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BusAdapter, BusMessage};
use crate::error::{FileMeshError, Result};

const CHANNEL_DEPTH: usize = 64;

type SubscriberMap = Arc<Mutex<HashMap<String, Vec<mpsc::Sender<BusMessage>>>>>;

/// Single-connection MQTT [`BusAdapter`].
pub struct MqttBus {
    client: AsyncClient,
    subscribers: SubscriberMap,
    topics: Arc<Mutex<HashSet<String>>>,
    connected: watch::Receiver<bool>,
}

impl MqttBus {
    /// Connect to the broker and start the pump task. The connection is
    /// established in the background; use [`MqttBus::wait_connected`] when
    /// startup must fail fast on an unreachable broker.
    pub fn connect(
        host: impl Into<String>,
        port: u16,
        client_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        let host = host.into();
        let client_id = client_id.into();
        let mut options = MqttOptions::new(client_id.clone(), host.clone(), port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);

        let (client, mut event_loop) = AsyncClient::new(options, CHANNEL_DEPTH);
        let subscribers: SubscriberMap = Arc::new(Mutex::new(HashMap::new()));
        let topics: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let (connected_tx, connected_rx) = watch::channel(false);

        let pump_subscribers = subscribers.clone();
        let pump_topics = topics.clone();
        let pump_client = client.clone();
        tokio::spawn(async move {
            info!(broker = %host, port, client = %client_id, "mqtt pump started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("mqtt pump stopped");
                        return;
                    }
                    event = event_loop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            let _ = connected_tx.send(true);
                            info!("mqtt broker connected");
                            let topics: Vec<String> =
                                pump_topics.lock().iter().cloned().collect();
                            for topic in topics {
                                if let Err(err) =
                                    pump_client.subscribe(topic.clone(), QoS::AtLeastOnce).await
                                {
                                    warn!(topic, error = %err, "mqtt resubscribe failed");
                                }
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            dispatch(&pump_subscribers, &publish.topic, publish.payload.clone());
                        }
                        Ok(_) => {}
                        Err(err) => {
                            let _ = connected_tx.send(false);
                            warn!(error = %err, "mqtt connection error, retrying");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        });

        MqttBus {
            client,
            subscribers,
            topics,
            connected: connected_rx,
        }
    }

    /// Wait until the broker connection is up, failing after `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut connected = self.connected.clone();
        tokio::time::timeout(timeout, connected.wait_for(|up| *up))
            .await
            .map_err(|_| {
                FileMeshError::BusUnavailable("broker connection timed out".into())
            })?
            .map_err(|_| FileMeshError::BusUnavailable("mqtt pump terminated".into()))?;
        Ok(())
    }
}

fn dispatch(subscribers: &SubscriberMap, topic: &str, payload: bytes::Bytes) {
    let mut subs = subscribers.lock();
    if let Some(senders) = subs.get_mut(topic) {
        senders.retain(|tx| {
            let msg = BusMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            match tx.try_send(msg) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(topic, "mqtt subscriber lagging, message dropped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    } else {
        debug!(topic, "mqtt message on topic without subscribers");
    }
}

#[async_trait]
impl BusAdapter for MqttBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|err| FileMeshError::BusUnavailable(err.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BusMessage>> {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        self.subscribers
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        self.topics.lock().insert(topic.to_string());
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|err| FileMeshError::BusUnavailable(err.to_string()))?;
        Ok(rx)
    }
}
