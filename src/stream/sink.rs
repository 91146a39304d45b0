//! Video sink boundary
//!
//! The rendering surface belongs to the UI; a session only attaches the
//! remote track on arrival and detaches it on teardown. Exactly one
//! session owns a sink at a time.

use std::sync::Arc;

use parking_lot::Mutex;
use webrtc::track::track_remote::TrackRemote;

/// Caller-supplied media sink
pub trait VideoSink: Send + Sync {
    /// Attach the remote track. Called once, on first track arrival.
    fn attach(&self, track: Arc<TrackRemote>);

    /// Drop whatever was attached. Safe when nothing is attached.
    fn detach(&self);
}

/// Sink holding the most recently attached track
///
/// Rendering glue polls `current()` and pulls RTP from the track.
#[derive(Default)]
pub struct LatestTrackSink {
    track: Mutex<Option<Arc<TrackRemote>>>,
}

impl LatestTrackSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn current(&self) -> Option<Arc<TrackRemote>> {
        self.track.lock().clone()
    }

    pub fn is_attached(&self) -> bool {
        self.track.lock().is_some()
    }
}

impl VideoSink for LatestTrackSink {
    fn attach(&self, track: Arc<TrackRemote>) {
        *self.track.lock() = Some(track);
    }

    fn detach(&self) {
        *self.track.lock() = None;
    }
}
