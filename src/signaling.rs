//! Signaling wire format and topic derivation
//!
//! Every signaling message is a JSON envelope carried over the broker:
//! `sub` names the message type, `id` correlates a request with its
//! reply, `reply` is the topic the device should answer on, and either
//! `data` or `params` carries the type-specific payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StreamError};

/// Signaling message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Ping,
    Pong,
    Call,
    Sdp,
    Candidate,
    Media,
    Bye,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Ping => write!(f, "ping"),
            SignalKind::Pong => write!(f, "pong"),
            SignalKind::Call => write!(f, "call"),
            SignalKind::Sdp => write!(f, "sdp"),
            SignalKind::Candidate => write!(f, "candidate"),
            SignalKind::Media => write!(f, "media"),
            SignalKind::Bye => write!(f, "bye"),
        }
    }
}

/// JSON envelope exchanged with the device over the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalMessage {
    /// Message type
    pub sub: SignalKind,
    /// Correlation id, echoed back by the device
    pub id: String,
    /// Topic replies should be published to
    pub reply: String,
    /// Type-specific payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Alternate payload field used by some device firmware revisions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl SignalMessage {
    pub fn new(sub: SignalKind, id: impl Into<String>, reply: impl Into<String>) -> Self {
        Self {
            sub,
            id: id.into(),
            reply: reply.into(),
            data: None,
            params: None,
        }
    }

    pub fn with_data(mut self, data: impl Serialize) -> Result<Self> {
        self.data = Some(serde_json::to_value(data)?);
        Ok(self)
    }

    /// Payload regardless of which field the device used
    pub fn payload(&self) -> Option<&Value> {
        self.data.as_ref().or(self.params.as_ref())
    }

    /// Decode the payload into a typed struct
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        let value = self.payload().ok_or_else(|| {
            StreamError::Signaling(format!("{} message carries no payload", self.sub))
        })?;
        serde_json::from_value(value.clone()).map_err(StreamError::from)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(StreamError::from)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(StreamError::from)
    }
}

/// Device-reported availability carried in a `pong`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Device is free to take a call
    Idle,
    /// Device already has a peer session
    P2p,
}

/// `pong` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicePresence {
    pub status: DeviceStatus,
}

/// SDP description direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// `sdp` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// `candidate` payload (trickle ICE, both directions)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

/// Outbound topic for a device
pub fn device_topic(device_id: &str) -> String {
    format!("device/{}/webrtc/v1", device_id)
}

/// Per-session inbound reply topic
pub fn reply_topic(username: &str, session_id: &str) -> String {
    format!("user/{}/{}/webrtc/v1", username, session_id)
}
