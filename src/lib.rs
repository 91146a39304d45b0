//! fleet-stream - live video for fleet dashboards
//!
//! This crate implements the signaling subsystem of a fleet-management
//! platform: WebRTC stream negotiation carried over a shared MQTT broker
//! connection, one signaling session per camera device, plus the
//! adapter boundary for the external push-to-talk engine.

pub mod broker;
pub mod config;
pub mod error;
pub mod events;
pub mod ptt;
pub mod signaling;
pub mod stream;

pub use broker::{BrokerMessage, BrokerTransport, MqttBroker};
pub use config::{BrokerConfig, IceConfig, StreamConfig, TurnServer};
pub use error::{Result, StreamError};
pub use events::{EventBus, StreamEvent};
pub use stream::{LatestTrackSink, SignalingSession, StreamRegistry, StreamState, StreamStatus, VideoSink};
