use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Peer connection error: {0}")]
    Peer(String),

    #[error("Device busy: {0}")]
    DeviceBusy(String),

    #[error("PTT error: {0}")]
    Ptt(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, StreamError>;
