//! Event bus for stream and PTT notifications
//!
//! Multi-subscriber broadcast: UI panels, loggers and tests can observe
//! the same stream without clobbering each other's handlers.

use tokio::sync::broadcast;

use crate::ptt::PttEvent;
use crate::stream::StreamState;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events published by sessions, the registry and the PTT panel
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A session moved to a new state
    StateChanged {
        device_id: String,
        state: StreamState,
    },
    /// A session hit an unrecoverable error
    StreamError {
        device_id: String,
        message: String,
    },
    /// The remote media track arrived and was attached to the sink
    TrackReceived { device_id: String },
    /// Forwarded push-to-talk event
    Ptt(PttEvent),
}

/// Broadcast bus distributing [`StreamEvent`]s to all subscribers
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StreamEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// With no active subscribers the event is silently dropped; events
    /// are fire-and-forget notifications.
    pub fn publish(&self, event: StreamEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(StreamEvent::StateChanged {
            device_id: "dev-1".to_string(),
            state: StreamState::Connecting,
        });

        for rx in [&mut rx1, &mut rx2] {
            let event = rx.recv().await.unwrap();
            assert!(matches!(event, StreamEvent::StateChanged { .. }));
        }
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish(StreamEvent::TrackReceived {
            device_id: "dev-1".to_string(),
        });
    }
}
