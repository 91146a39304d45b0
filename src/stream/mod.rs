//! Per-device stream sessions and their registry
//!
//! Control flow:
//! ```text
//! UI -- start_stream(device, sink) --> StreamRegistry
//!        |                                |
//!        |                                v
//!        |                        SignalingSession -- ping/call/sdp/candidate --> broker --> device
//!        |                                |
//!        |                                v
//!        |                        RTCPeerConnection -- media track --> VideoSink
//!        v
//!   StreamStatus projection (idle/connecting/connected/streaming/error/stopped)
//! ```

pub mod registry;
pub mod session;
pub mod sink;
pub mod state;

pub use registry::StreamRegistry;
pub use session::SignalingSession;
pub use sink::{LatestTrackSink, VideoSink};
pub use state::{StreamState, StreamStatus};
