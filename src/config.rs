//! Broker, ICE and stream configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// MQTT broker connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker hostname
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Client identifier presented to the broker
    pub client_id: String,
    /// Username for broker authentication
    pub username: Option<String>,
    /// Password for broker authentication
    pub password: Option<String>,
    /// Keep-alive interval in seconds
    pub keep_alive_secs: u64,
    /// Delay before the transport retries the socket after a poll error
    pub reconnect_delay_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "fleet-stream".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 30,
            reconnect_delay_secs: 4,
        }
    }
}

impl BrokerConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN server URLs (e.g., ["turn:turn.example.com:3478?transport=udp"])
    pub urls: Vec<String>,
    /// Username for TURN authentication
    pub username: String,
    /// Credential for TURN authentication
    pub credential: String,
}

impl TurnServer {
    pub fn new(url: impl Into<String>, username: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: username.into(),
            credential: credential.into(),
        }
    }
}

/// ICE server configuration, fixed for the whole process (not per-session)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_servers: Vec<TurnServer>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: vec![],
        }
    }
}

impl IceConfig {
    /// Empty configuration - host candidates only, useful on closed networks
    pub fn none() -> Self {
        Self {
            stun_servers: vec![],
            turn_servers: vec![],
        }
    }
}

/// Per-stream handshake tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Username scoping the per-session reply topic
    pub username: String,
    /// Maximum retries while the device reports itself busy
    pub busy_retry_limit: u32,
    /// Delay between busy retries, in milliseconds
    pub busy_retry_delay_ms: u64,
    /// Handshake timeout in seconds; None disables the deadline
    pub handshake_timeout_secs: Option<u64>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            username: "operator".to_string(),
            busy_retry_limit: 3,
            busy_retry_delay_ms: 2000,
            handshake_timeout_secs: Some(30),
        }
    }
}

impl StreamConfig {
    pub fn busy_retry_delay(&self) -> Duration {
        Duration::from_millis(self.busy_retry_delay_ms)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_broker_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.port, 1883);
        assert_eq!(config.keep_alive(), Duration::from_secs(30));
    }

    #[test]
    fn stream_config_timeout_can_be_disabled() {
        let mut config = StreamConfig::default();
        assert_eq!(config.handshake_timeout(), Some(Duration::from_secs(30)));
        config.handshake_timeout_secs = None;
        assert_eq!(config.handshake_timeout(), None);
    }
}
