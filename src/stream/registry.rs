//! Stream session registry
//!
//! Owns the `device_id -> session` map and the per-device status
//! projection the UI reads. Starting a stream for a device that already
//! has one is a no-op; the session is inserted into the map before any
//! await so two racing starts still produce exactly one handshake.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::session::SignalingSession;
use super::sink::VideoSink;
use super::state::StreamStatus;
use crate::broker::BrokerTransport;
use crate::config::{IceConfig, StreamConfig};
use crate::error::Result;
use crate::events::{EventBus, StreamEvent};

/// Registry of active signaling sessions, one per device
pub struct StreamRegistry {
    broker: Arc<dyn BrokerTransport>,
    config: StreamConfig,
    ice: IceConfig,
    events: EventBus,
    sessions: Arc<RwLock<HashMap<String, Arc<SignalingSession>>>>,
    /// Last known status per device; survives session retirement until a
    /// new start replaces it
    statuses: Arc<RwLock<HashMap<String, StreamStatus>>>,
}

impl StreamRegistry {
    pub fn new(broker: Arc<dyn BrokerTransport>, config: StreamConfig, ice: IceConfig) -> Self {
        Self {
            broker,
            config,
            ice,
            events: EventBus::new(),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            statuses: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start a stream for a device. No-op if one is already active.
    ///
    /// Ensures the shared broker connection first, then begins the
    /// handshake. A transport failure here surfaces to the caller; every
    /// later failure is reported through the status projection.
    pub async fn start_stream(&self, device_id: &str, sink: Arc<dyn VideoSink>) -> Result<()> {
        let session = {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(device_id) {
                debug!("Stream for {} already active, start ignored", device_id);
                return Ok(());
            }
            let session = SignalingSession::new(
                device_id,
                sink,
                self.broker.clone(),
                self.events.clone(),
                self.config.clone(),
                self.ice.clone(),
            );
            sessions.insert(device_id.to_string(), session.clone());
            session
        };
        self.statuses
            .write()
            .insert(device_id.to_string(), session.status());
        self.watch_session(device_id, &session);

        info!("Starting stream for {}", device_id);
        if let Err(e) = self.broker.connect().await {
            session
                .abort(&format!("broker connect failed: {}", e))
                .await;
            return Err(e);
        }
        session.connect().await
    }

    /// Stop the stream for a device. No-op for unknown devices.
    pub async fn stop_stream(&self, device_id: &str) {
        let session = self.sessions.write().remove(device_id);
        match session {
            Some(session) => {
                info!("Stopping stream for {}", device_id);
                session.disconnect().await;
            }
            None => debug!("Stop for unknown device {} ignored", device_id),
        }
    }

    /// Project the session's status into the shared map and retire it
    /// from the active set once it reaches a terminal state.
    fn watch_session(&self, device_id: &str, session: &Arc<SignalingSession>) {
        let mut rx = session.watch();
        let sessions = self.sessions.clone();
        let statuses = self.statuses.clone();
        let watched = session.clone();
        let device_id = device_id.to_string();

        tokio::spawn(async move {
            loop {
                let status = rx.borrow_and_update().clone();
                let terminal = status.state.is_terminal();
                statuses.write().insert(device_id.clone(), status);

                if terminal {
                    let mut sessions = sessions.write();
                    // A replacement session may already be in the slot
                    if let Some(current) = sessions.get(&device_id) {
                        if Arc::ptr_eq(current, &watched) {
                            sessions.remove(&device_id);
                        }
                    }
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        });
    }

    /// Last known status for a device, if any stream was ever started
    pub fn status(&self, device_id: &str) -> Option<StreamStatus> {
        self.statuses.read().get(device_id).cloned()
    }

    /// Snapshot of every known device status
    pub fn statuses(&self) -> HashMap<String, StreamStatus> {
        self.statuses.read().clone()
    }

    pub fn is_active(&self, device_id: &str) -> bool {
        self.sessions.read().contains_key(device_id)
    }

    pub fn active_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Subscribe to stream events (state changes, errors, tracks, PTT)
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    /// Shared event bus, e.g. for wiring up a PTT panel
    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    /// Disconnect every active session, then the broker
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = {
            let mut map = self.sessions.write();
            map.drain().collect()
        };
        for (device_id, session) in sessions {
            debug!("Shutting down stream for {}", device_id);
            session.disconnect().await;
        }
        self.broker.disconnect().await;
        info!("Stream registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::broker::testing::MockBroker;
    use crate::signaling::{device_topic, SignalKind};
    use crate::stream::sink::LatestTrackSink;
    use crate::stream::state::StreamState;

    fn registry_with(broker: &Arc<MockBroker>) -> StreamRegistry {
        StreamRegistry::new(
            broker.clone() as Arc<dyn BrokerTransport>,
            StreamConfig {
                username: "alice".to_string(),
                ..StreamConfig::default()
            },
            IceConfig::none(),
        )
    }

    fn pings_to(broker: &MockBroker, device_id: &str) -> usize {
        broker
            .published_to(&device_topic(device_id))
            .iter()
            .filter(|m| m.sub == SignalKind::Ping)
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_per_device() {
        let broker = Arc::new(MockBroker::new());
        let registry = registry_with(&broker);

        registry
            .start_stream("dev-1", LatestTrackSink::new())
            .await
            .unwrap();
        registry
            .start_stream("dev-1", LatestTrackSink::new())
            .await
            .unwrap();

        assert_eq!(registry.active_count(), 1);
        assert_eq!(pings_to(&broker, "dev-1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn racing_starts_send_one_ping() {
        let broker = Arc::new(MockBroker::new().with_connect_delay(Duration::from_millis(20)));
        let registry = registry_with(&broker);

        let (a, b) = tokio::join!(
            registry.start_stream("dev-1", LatestTrackSink::new()),
            registry.start_stream("dev-1", LatestTrackSink::new()),
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(pings_to(&broker, "dev-1"), 1);
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_unknown_device_is_a_noop() {
        let broker = Arc::new(MockBroker::new());
        let registry = registry_with(&broker);
        registry.stop_stream("nope").await;
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_retires_session_but_keeps_last_status() {
        let broker = Arc::new(MockBroker::new());
        let registry = registry_with(&broker);

        registry
            .start_stream("dev-1", LatestTrackSink::new())
            .await
            .unwrap();
        assert!(registry.is_active("dev-1"));

        registry.stop_stream("dev-1").await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!registry.is_active("dev-1"));
        let status = registry.status("dev-1").unwrap();
        assert_eq!(status.state, StreamState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn broker_failure_surfaces_and_retires_the_session() {
        let broker = Arc::new(MockBroker::failing());
        let registry = registry_with(&broker);

        let result = registry.start_stream("dev-1", LatestTrackSink::new()).await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!registry.is_active("dev-1"));
        let status = registry.status("dev-1").unwrap();
        assert_eq!(status.state, StreamState::Error);
        assert!(status.error.unwrap().contains("broker connect failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_session_leaves_error_visible() {
        let broker = Arc::new(MockBroker::new());
        let registry = StreamRegistry::new(
            broker.clone() as Arc<dyn BrokerTransport>,
            StreamConfig {
                username: "alice".to_string(),
                handshake_timeout_secs: Some(1),
                ..StreamConfig::default()
            },
            IceConfig::none(),
        );

        registry
            .start_stream("dev-1", LatestTrackSink::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(!registry.is_active("dev-1"));
        assert_eq!(registry.status("dev-1").unwrap().state, StreamState::Error);

        // A fresh start replaces the failed session
        registry
            .start_stream("dev-1", LatestTrackSink::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(registry.is_active("dev-1"));
        assert_eq!(
            registry.status("dev-1").unwrap().state,
            StreamState::Connecting
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_disconnects_sessions_and_broker() {
        let broker = Arc::new(MockBroker::new());
        let registry = registry_with(&broker);

        registry
            .start_stream("dev-1", LatestTrackSink::new())
            .await
            .unwrap();
        registry
            .start_stream("dev-2", LatestTrackSink::new())
            .await
            .unwrap();
        assert_eq!(registry.active_count(), 2);

        registry.shutdown().await;
        assert_eq!(registry.active_count(), 0);
        assert!(!broker.is_connected().await);
        assert!(broker.subscriptions().is_empty());
    }
}
