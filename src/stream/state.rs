//! Stream state machine and per-device status projection

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session state as consumed by the UI layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    /// Session constructed, handshake not started
    Idle,
    /// `ping` sent, waiting for the device
    Connecting,
    /// Offer answered, waiting for media
    Connected,
    /// Remote track attached to the sink
    Streaming,
    /// Unrecoverable failure; discard the session and start a new one
    Error,
    /// Explicit disconnect completed
    Stopped,
}

impl StreamState {
    /// Terminal states remove the session from the active registry
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Error | StreamState::Stopped)
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamState::Idle => write!(f, "idle"),
            StreamState::Connecting => write!(f, "connecting"),
            StreamState::Connected => write!(f, "connected"),
            StreamState::Streaming => write!(f, "streaming"),
            StreamState::Error => write!(f, "error"),
            StreamState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Read-only per-device snapshot exposed to the UI
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub state: StreamState,
    /// Error message when `state` is `Error`
    pub error: Option<String>,
    pub last_activity: DateTime<Utc>,
}

impl StreamStatus {
    pub fn idle() -> Self {
        Self::advance(StreamState::Idle)
    }

    pub(crate) fn advance(state: StreamState) -> Self {
        Self {
            state,
            error: None,
            last_activity: Utc::now(),
        }
    }

    pub(crate) fn failed(message: impl Into<String>) -> Self {
        Self {
            state: StreamState::Error,
            error: Some(message.into()),
            last_activity: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(StreamState::Error.is_terminal());
        assert!(StreamState::Stopped.is_terminal());
        assert!(!StreamState::Streaming.is_terminal());
    }

    #[test]
    fn failed_status_carries_message() {
        let status = StreamStatus::failed("device busy");
        assert_eq!(status.state, StreamState::Error);
        assert_eq!(status.error.as_deref(), Some("device busy"));
    }
}
