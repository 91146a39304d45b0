//! Push-to-talk adapter
//!
//! The PTT/duplex-call engine is an opaque external module; this adapter
//! only defines the capability surface the dashboard drives and forwards
//! the engine's events onto the shared event bus. The client comes from
//! an injected factory, never from ambient/global state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{Result, StreamError};
use crate::events::{EventBus, StreamEvent};

/// Events emitted by the external PTT engine
#[derive(Debug, Clone)]
pub enum PttEvent {
    Connected,
    Disconnected,
    /// The floor was granted for a talk group
    TalkGranted { group_id: String },
    /// The floor was released
    TalkReleased { group_id: String },
    /// Incoming duplex call from a fleet member
    IncomingCall { member_id: String },
    CallEnded,
    Error { message: String },
}

/// Capability surface of the external PTT client
#[async_trait]
pub trait PttClient: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn start_talk(&self, group_id: &str) -> Result<()>;
    async fn stop_talk(&self) -> Result<()>;
    async fn duplex_call(&self, member_id: &str) -> Result<()>;
    async fn hangup(&self) -> Result<()>;
    fn events(&self) -> broadcast::Receiver<PttEvent>;
}

/// Produces the concrete client; injected so tests and alternative
/// engine builds can swap the implementation.
pub trait PttClientFactory: Send + Sync {
    fn create(&self) -> Arc<dyn PttClient>;
}

/// Dashboard-facing PTT panel
///
/// Owns one client, relays its events to the bus and tracks whether we
/// currently hold the floor.
pub struct PttPanel {
    client: Arc<dyn PttClient>,
    events: EventBus,
    talking: Arc<AtomicBool>,
    forward: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl PttPanel {
    pub fn new(factory: &dyn PttClientFactory, events: EventBus) -> Self {
        Self {
            client: factory.create(),
            events,
            talking: Arc::new(AtomicBool::new(false)),
            forward: parking_lot::Mutex::new(None),
        }
    }

    /// Connect the engine and start forwarding its events
    pub async fn connect(&self) -> Result<()> {
        self.client.connect().await?;

        let mut rx = self.client.events();
        let bus = self.events.clone();
        let talking = self.talking.clone();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        match &event {
                            PttEvent::TalkGranted { group_id } => {
                                info!("PTT floor granted for group {}", group_id);
                                talking.store(true, Ordering::SeqCst);
                            }
                            PttEvent::TalkReleased { group_id } => {
                                info!("PTT floor released for group {}", group_id);
                                talking.store(false, Ordering::SeqCst);
                            }
                            PttEvent::Disconnected => talking.store(false, Ordering::SeqCst),
                            _ => {}
                        }
                        bus.publish(StreamEvent::Ptt(event));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("PTT event forwarder lagged, {} events skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.forward.lock() = Some(task);
        Ok(())
    }

    pub async fn start_talk(&self, group_id: &str) -> Result<()> {
        if self.talking.load(Ordering::SeqCst) {
            return Err(StreamError::Ptt("already talking".to_string()));
        }
        self.client.start_talk(group_id).await
    }

    pub async fn stop_talk(&self) -> Result<()> {
        self.client.stop_talk().await
    }

    pub async fn duplex_call(&self, member_id: &str) -> Result<()> {
        self.client.duplex_call(member_id).await
    }

    pub async fn hangup(&self) -> Result<()> {
        self.client.hangup().await
    }

    pub fn is_talking(&self) -> bool {
        self.talking.load(Ordering::SeqCst)
    }

    /// Stop forwarding events; the client itself is dropped with the panel
    pub fn shutdown(&self) {
        if let Some(task) = self.forward.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    struct FakePttClient {
        tx: broadcast::Sender<PttEvent>,
        talk_calls: AtomicUsize,
    }

    impl FakePttClient {
        fn new() -> Arc<Self> {
            let (tx, _) = broadcast::channel(16);
            Arc::new(Self {
                tx,
                talk_calls: AtomicUsize::new(0),
            })
        }

        fn emit(&self, event: PttEvent) {
            let _ = self.tx.send(event);
        }
    }

    #[async_trait]
    impl PttClient for FakePttClient {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn start_talk(&self, _group_id: &str) -> Result<()> {
            self.talk_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn stop_talk(&self) -> Result<()> {
            Ok(())
        }
        async fn duplex_call(&self, _member_id: &str) -> Result<()> {
            Ok(())
        }
        async fn hangup(&self) -> Result<()> {
            Ok(())
        }
        fn events(&self) -> broadcast::Receiver<PttEvent> {
            self.tx.subscribe()
        }
    }

    struct FakeFactory {
        client: Arc<FakePttClient>,
    }

    impl PttClientFactory for FakeFactory {
        fn create(&self) -> Arc<dyn PttClient> {
            self.client.clone()
        }
    }

    #[tokio::test]
    async fn forwards_engine_events_to_the_bus() {
        let client = FakePttClient::new();
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let panel = PttPanel::new(
            &FakeFactory {
                client: client.clone(),
            },
            bus,
        );
        panel.connect().await.unwrap();

        client.emit(PttEvent::TalkGranted {
            group_id: "g-1".to_string(),
        });

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            StreamEvent::Ptt(PttEvent::TalkGranted { .. })
        ));
        assert!(panel.is_talking());

        client.emit(PttEvent::TalkReleased {
            group_id: "g-1".to_string(),
        });
        let _ = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(!panel.is_talking());
        panel.shutdown();
    }

    #[tokio::test]
    async fn start_talk_while_talking_is_rejected() {
        let client = FakePttClient::new();
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let panel = PttPanel::new(
            &FakeFactory {
                client: client.clone(),
            },
            bus,
        );
        panel.connect().await.unwrap();

        panel.start_talk("g-1").await.unwrap();
        client.emit(PttEvent::TalkGranted {
            group_id: "g-1".to_string(),
        });
        let _ = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;

        assert!(panel.start_talk("g-1").await.is_err());
        assert_eq!(client.talk_calls.load(Ordering::SeqCst), 1);
        panel.shutdown();
    }
}
