//! Shared broker connection
//!
//! One MQTT connection serves every active stream session. Inbound
//! messages are fanned out on a broadcast channel; each session filters
//! by its own reply topic. The connection object is injected into the
//! registry rather than living in a module global, so tests can swap in
//! a mock transport.

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::error::{Result, StreamError};

/// Inbound message fan-out capacity (ring buffer size)
const MESSAGE_CHANNEL_CAPACITY: usize = 256;

/// Inbound broker message
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Publish/subscribe transport shared by all signaling sessions
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Idempotent connect. Concurrent callers share one connection
    /// attempt; a hard failure clears the guard so a later call retries.
    async fn connect(&self) -> Result<()>;

    /// Close the transport. Safe to call when already disconnected.
    async fn disconnect(&self);

    /// Register interest in a topic. Failures are logged, not returned;
    /// callers retry at a higher level if no messages arrive.
    async fn subscribe(&self, topic: &str);

    /// Drop interest in a topic. Fire-and-forget like `subscribe`.
    async fn unsubscribe(&self, topic: &str);

    /// Send a message. No delivery acknowledgment is modeled.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Broadcast receiver of every inbound message regardless of topic.
    fn messages(&self) -> broadcast::Receiver<BrokerMessage>;
}

struct MqttHandle {
    client: AsyncClient,
    poll_task: JoinHandle<()>,
}

/// MQTT-backed broker transport (rumqttc)
pub struct MqttBroker {
    config: BrokerConfig,
    /// Live connection, if any. The mutex also serializes `connect()`
    /// so concurrent callers produce exactly one CONNECT.
    handle: Mutex<Option<MqttHandle>>,
    messages: broadcast::Sender<BrokerMessage>,
}

impl MqttBroker {
    pub fn new(config: BrokerConfig) -> Self {
        let (messages, _) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);
        Self {
            config,
            handle: Mutex::new(None),
            messages,
        }
    }
}

#[async_trait]
impl BrokerTransport for MqttBroker {
    async fn connect(&self) -> Result<()> {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return Ok(());
        }

        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.host.clone(),
            self.config.port,
        );
        options.set_keep_alive(self.config.keep_alive());
        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let (ready_tx, ready_rx) = oneshot::channel();
        let messages = self.messages.clone();
        let reconnect_delay = self.config.reconnect_delay();

        let poll_task = tokio::spawn(async move {
            let mut ready = Some(ready_tx);
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        debug!("Broker handshake complete");
                        if let Some(tx) = ready.take() {
                            let _ = tx.send(Ok(()));
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        // No subscribers is normal when no session is active
                        let _ = messages.send(BrokerMessage {
                            topic: publish.topic,
                            payload: publish.payload,
                        });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if let Some(tx) = ready.take() {
                            // Hard failure before the handshake: reject
                            // the pending connect and stop polling.
                            let _ = tx.send(Err(StreamError::Broker(format!(
                                "connect failed: {}",
                                e
                            ))));
                            return;
                        }
                        // Socket-level retry once connected, mirroring
                        // the transport's reconnect period.
                        warn!("Broker transport error, retrying: {}", e);
                        tokio::time::sleep(reconnect_delay).await;
                    }
                }
            }
        });

        match ready_rx.await {
            Ok(Ok(())) => {
                info!(
                    "Connected to broker {}:{}",
                    self.config.host, self.config.port
                );
                *handle = Some(MqttHandle { client, poll_task });
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                poll_task.abort();
                Err(StreamError::Broker(
                    "connect aborted before handshake".to_string(),
                ))
            }
        }
    }

    async fn disconnect(&self) {
        let mut handle = self.handle.lock().await;
        if let Some(h) = handle.take() {
            if let Err(e) = h.client.disconnect().await {
                debug!("Broker disconnect: {}", e);
            }
            h.poll_task.abort();
            info!("Disconnected from broker");
        }
    }

    async fn subscribe(&self, topic: &str) {
        let handle = self.handle.lock().await;
        match handle.as_ref() {
            Some(h) => {
                if let Err(e) = h.client.subscribe(topic, QoS::AtMostOnce).await {
                    warn!("Subscribe to {} failed: {}", topic, e);
                }
            }
            None => warn!("Subscribe to {} while disconnected", topic),
        }
    }

    async fn unsubscribe(&self, topic: &str) {
        let handle = self.handle.lock().await;
        if let Some(h) = handle.as_ref() {
            if let Err(e) = h.client.unsubscribe(topic).await {
                warn!("Unsubscribe from {} failed: {}", topic, e);
            }
        }
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let handle = self.handle.lock().await;
        let h = handle
            .as_ref()
            .ok_or_else(|| StreamError::Broker("not connected".to_string()))?;
        h.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| StreamError::Broker(format!("publish to {} failed: {}", topic, e)))
    }

    fn messages(&self) -> broadcast::Receiver<BrokerMessage> {
        self.messages.subscribe()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory transport for session and registry tests

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::signaling::SignalMessage;

    /// Mock transport recording publishes and injecting inbound messages
    pub struct MockBroker {
        connect_attempts: AtomicUsize,
        connect_delay: Option<Duration>,
        fail_connect: bool,
        connected: Mutex<bool>,
        publishes: parking_lot::Mutex<Vec<(String, Vec<u8>)>>,
        subscriptions: parking_lot::Mutex<Vec<String>>,
        tx: broadcast::Sender<BrokerMessage>,
    }

    impl MockBroker {
        pub fn new() -> Self {
            let (tx, _) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);
            Self {
                connect_attempts: AtomicUsize::new(0),
                connect_delay: None,
                fail_connect: false,
                connected: Mutex::new(false),
                publishes: parking_lot::Mutex::new(Vec::new()),
                subscriptions: parking_lot::Mutex::new(Vec::new()),
                tx,
            }
        }

        pub fn with_connect_delay(mut self, delay: Duration) -> Self {
            self.connect_delay = Some(delay);
            self
        }

        pub fn failing() -> Self {
            let mut broker = Self::new();
            broker.fail_connect = true;
            broker
        }

        pub fn connect_attempts(&self) -> usize {
            self.connect_attempts.load(Ordering::SeqCst)
        }

        pub async fn is_connected(&self) -> bool {
            *self.connected.lock().await
        }

        /// Push an inbound message as if the broker delivered it
        pub fn inject(&self, topic: &str, message: &SignalMessage) {
            self.inject_raw(topic, message.encode().unwrap());
        }

        pub fn inject_raw(&self, topic: &str, payload: Vec<u8>) {
            let _ = self.tx.send(BrokerMessage {
                topic: topic.to_string(),
                payload: Bytes::from(payload),
            });
        }

        pub fn published(&self) -> Vec<(String, SignalMessage)> {
            self.publishes
                .lock()
                .iter()
                .map(|(topic, payload)| (topic.clone(), SignalMessage::decode(payload).unwrap()))
                .collect()
        }

        pub fn published_to(&self, topic: &str) -> Vec<SignalMessage> {
            self.published()
                .into_iter()
                .filter(|(t, _)| t == topic)
                .map(|(_, m)| m)
                .collect()
        }

        pub fn subscriptions(&self) -> Vec<String> {
            self.subscriptions.lock().clone()
        }
    }

    #[async_trait]
    impl BrokerTransport for MockBroker {
        async fn connect(&self) -> Result<()> {
            let mut connected = self.connected.lock().await;
            if *connected {
                return Ok(());
            }
            if let Some(delay) = self.connect_delay {
                tokio::time::sleep(delay).await;
            }
            self.connect_attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect {
                return Err(StreamError::Broker("mock connect refused".to_string()));
            }
            *connected = true;
            Ok(())
        }

        async fn disconnect(&self) {
            *self.connected.lock().await = false;
        }

        async fn subscribe(&self, topic: &str) {
            self.subscriptions.lock().push(topic.to_string());
        }

        async fn unsubscribe(&self, topic: &str) {
            self.subscriptions.lock().retain(|t| t != topic);
        }

        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
            self.publishes.lock().push((topic.to_string(), payload));
            Ok(())
        }

        fn messages(&self) -> broadcast::Receiver<BrokerMessage> {
            self.tx.subscribe()
        }
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_attempt() {
        let broker = MockBroker::new().with_connect_delay(Duration::from_millis(10));
        let (a, b) = tokio::join!(broker.connect(), broker.connect());
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn failed_connect_can_be_retried() {
        let broker = MockBroker::failing();
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_err());
        assert_eq!(broker.connect_attempts(), 2);
    }
}
