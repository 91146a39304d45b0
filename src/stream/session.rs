//! Signaling session state machine
//!
//! One session per requested device stream. The session subscribes to
//! its own reply topic, drives the ping/call/sdp/candidate/bye handshake
//! against the device topic, and owns exactly one peer connection at a
//! time. Messages are processed sequentially on a single dispatch task;
//! anything addressed to another session's reply topic is ignored.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use super::sink::VideoSink;
use super::state::{StreamState, StreamStatus};
use crate::broker::{BrokerMessage, BrokerTransport};
use crate::config::{IceConfig, StreamConfig};
use crate::error::{Result, StreamError};
use crate::events::{EventBus, StreamEvent};
use crate::signaling::{
    device_topic, reply_topic, DevicePresence, DeviceStatus, IceCandidatePayload, SdpDescription,
    SdpKind, SignalKind, SignalMessage,
};

/// One stream negotiation for one device
pub struct SignalingSession {
    device_id: String,
    session_id: String,
    /// Correlation id echoed in every message payload
    message_id: String,
    device_topic: String,
    reply_topic: String,
    broker: Arc<dyn BrokerTransport>,
    ice: IceConfig,
    config: StreamConfig,
    sink: Arc<dyn VideoSink>,
    events: EventBus,
    /// Exactly one peer connection at a time; created on SDP offer
    peer: Mutex<Option<Arc<RTCPeerConnection>>>,
    status: watch::Sender<StreamStatus>,
    /// Busy-device retry counter
    retry_count: AtomicU32,
    /// Set once the offer was answered; gates the outgoing `bye`
    established: AtomicBool,
    dispatch: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SignalingSession {
    pub fn new(
        device_id: impl Into<String>,
        sink: Arc<dyn VideoSink>,
        broker: Arc<dyn BrokerTransport>,
        events: EventBus,
        config: StreamConfig,
        ice: IceConfig,
    ) -> Arc<Self> {
        let device_id = device_id.into();
        let session_id = uuid::Uuid::new_v4().to_string();
        let message_id = uuid::Uuid::new_v4().to_string();
        let device_topic = device_topic(&device_id);
        let reply_topic = reply_topic(&config.username, &session_id);
        let (status, _) = watch::channel(StreamStatus::idle());

        Arc::new(Self {
            device_id,
            session_id,
            message_id,
            device_topic,
            reply_topic,
            broker,
            ice,
            config,
            sink,
            events,
            peer: Mutex::new(None),
            status,
            retry_count: AtomicU32::new(0),
            established: AtomicBool::new(false),
            dispatch: parking_lot::Mutex::new(None),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn reply_topic(&self) -> &str {
        &self.reply_topic
    }

    pub fn state(&self) -> StreamState {
        self.status.borrow().state
    }

    pub fn status(&self) -> StreamStatus {
        self.status.borrow().clone()
    }

    /// Watch channel following every status change
    pub fn watch(&self) -> watch::Receiver<StreamStatus> {
        self.status.subscribe()
    }

    /// Begin the handshake: subscribe the reply topic and send `ping`.
    ///
    /// The broker must already be connected. Transport failures here
    /// surface to the caller; everything after this point is reported
    /// through the status projection instead.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.state() != StreamState::Idle {
            return Ok(());
        }
        self.set_state(StreamState::Connecting);

        self.broker.subscribe(&self.reply_topic).await;
        let rx = self.broker.messages();

        let session = self.clone();
        let task = tokio::spawn(async move {
            session.run_dispatch(rx).await;
        });
        *self.dispatch.lock() = Some(task);

        info!(
            "Session {} connecting to {} (reply {})",
            self.session_id, self.device_id, self.reply_topic
        );
        if let Err(e) = self.send(SignalKind::Ping).await {
            self.fail(&e.to_string()).await;
            return Err(e);
        }
        Ok(())
    }

    /// Tear the session down: `bye` if established, close the peer,
    /// detach the sink, drop the reply subscription.
    pub async fn disconnect(&self) {
        if let Some(task) = self.dispatch.lock().take() {
            task.abort();
        }

        if self.established.load(Ordering::SeqCst) {
            if let Err(e) = self.send(SignalKind::Bye).await {
                debug!("Session {} bye not delivered: {}", self.session_id, e);
            }
        }

        self.close_peer().await;
        self.sink.detach();
        self.broker.unsubscribe(&self.reply_topic).await;

        if self.state() != StreamState::Error {
            self.set_state(StreamState::Stopped);
        }
        info!("Session {} for {} stopped", self.session_id, self.device_id);
    }

    /// Mark the session failed before the handshake ever started (e.g.
    /// the shared broker connection could not be established).
    pub(crate) async fn abort(&self, message: &str) {
        self.fail(message).await;
    }

    async fn run_dispatch(self: Arc<Self>, mut rx: broadcast::Receiver<BrokerMessage>) {
        let deadline = async {
            match self.config.handshake_timeout() {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => futures::future::pending().await,
            }
        };
        tokio::pin!(deadline);
        let mut status_rx = self.status.subscribe();

        loop {
            tokio::select! {
                _ = &mut deadline, if !self.negotiated() => {
                    self.fail("handshake timed out").await;
                    break;
                }
                changed = status_rx.changed() => {
                    // Ends the task once a failure elsewhere (peer
                    // callback, explicit abort) made the state terminal.
                    if changed.is_err() || self.state().is_terminal() {
                        break;
                    }
                }
                msg = rx.recv() => match msg {
                    Ok(msg) => {
                        if msg.topic != self.reply_topic {
                            continue;
                        }
                        if self.state().is_terminal() {
                            break;
                        }
                        self.handle_raw(&msg).await;
                        if self.state().is_terminal() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            "Session {} lagged behind broker fan-out, {} messages skipped",
                            self.session_id, skipped
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    /// Negotiation is done once the offer was answered; the handshake
    /// deadline no longer applies.
    fn negotiated(&self) -> bool {
        !matches!(self.state(), StreamState::Idle | StreamState::Connecting)
    }

    async fn handle_raw(self: &Arc<Self>, msg: &BrokerMessage) {
        let message = match SignalMessage::decode(&msg.payload) {
            Ok(message) => message,
            Err(e) => {
                self.fail(&format!("malformed message: {}", e)).await;
                return;
            }
        };
        if let Err(e) = self.handle_message(&message).await {
            self.fail(&e.to_string()).await;
        }
    }

    async fn handle_message(self: &Arc<Self>, msg: &SignalMessage) -> Result<()> {
        debug!(
            "Session {} received {} from {}",
            self.session_id, msg.sub, self.device_id
        );
        match msg.sub {
            SignalKind::Pong => self.handle_pong(msg).await,
            SignalKind::Sdp => self.handle_sdp(msg).await,
            SignalKind::Candidate => self.handle_candidate(msg).await,
            SignalKind::Bye => {
                info!("Device {} ended session {}", self.device_id, self.session_id);
                self.close_peer().await;
                self.sink.detach();
                self.broker.unsubscribe(&self.reply_topic).await;
                self.set_state(StreamState::Stopped);
                Ok(())
            }
            SignalKind::Ping | SignalKind::Call | SignalKind::Media => {
                debug!("Ignoring {} on reply topic", msg.sub);
                Ok(())
            }
        }
    }

    async fn handle_pong(&self, msg: &SignalMessage) -> Result<()> {
        let presence: DevicePresence = msg.payload_as()?;
        match presence.status {
            DeviceStatus::Idle => {
                self.retry_count.store(0, Ordering::SeqCst);
                self.send(SignalKind::Call).await
            }
            DeviceStatus::P2p => {
                let attempt = self.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt >= self.config.busy_retry_limit {
                    return Err(StreamError::DeviceBusy(format!(
                        "device {} busy after {} attempts",
                        self.device_id, attempt
                    )));
                }
                warn!(
                    "Device {} busy (p2p), retry {}/{}",
                    self.device_id, attempt, self.config.busy_retry_limit
                );
                self.send(SignalKind::Bye).await?;
                tokio::time::sleep(self.config.busy_retry_delay()).await;
                self.send(SignalKind::Ping).await
            }
        }
    }

    async fn handle_sdp(self: &Arc<Self>, msg: &SignalMessage) -> Result<()> {
        let desc: SdpDescription = msg.payload_as()?;
        if desc.kind != SdpKind::Offer {
            debug!("Ignoring sdp answer echo on session {}", self.session_id);
            return Ok(());
        }

        // A second offer replaces the peer connection; close the old one
        // so it is not orphaned.
        if let Some(old) = self.peer.lock().await.take() {
            warn!(
                "Session {} got a new offer with a peer connection open, replacing",
                self.session_id
            );
            if let Err(e) = old.close().await {
                debug!("Closing replaced peer connection: {}", e);
            }
        }

        let pc = self.build_peer().await?;
        *self.peer.lock().await = Some(pc.clone());

        let offer = RTCSessionDescription::offer(desc.sdp)
            .map_err(|e| StreamError::Peer(format!("invalid SDP offer: {}", e)))?;
        pc.set_remote_description(offer)
            .await
            .map_err(|e| StreamError::Peer(format!("set remote description: {}", e)))?;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| StreamError::Peer(format!("create answer: {}", e)))?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(|e| StreamError::Peer(format!("set local description: {}", e)))?;

        self.send_with(
            SignalKind::Sdp,
            SdpDescription {
                kind: SdpKind::Answer,
                sdp: answer.sdp,
            },
        )
        .await?;

        self.established.store(true, Ordering::SeqCst);
        self.set_state(StreamState::Connected);
        info!(
            "Session {} answered offer from {}",
            self.session_id, self.device_id
        );
        Ok(())
    }

    async fn handle_candidate(&self, msg: &SignalMessage) -> Result<()> {
        let payload: IceCandidatePayload = match msg.payload_as() {
            Ok(payload) => payload,
            Err(e) => {
                // Orphan/garbled candidates are non-fatal
                debug!("Dropping unreadable candidate: {}", e);
                return Ok(());
            }
        };

        let peer = self.peer.lock().await;
        let Some(pc) = peer.as_ref() else {
            debug!(
                "Session {} dropping candidate, no peer connection yet",
                self.session_id
            );
            return Ok(());
        };

        let init = RTCIceCandidateInit {
            candidate: payload.candidate,
            sdp_mid: payload.sdp_mid,
            sdp_mline_index: payload.sdp_mline_index,
            username_fragment: payload.username_fragment,
        };
        pc.add_ice_candidate(init)
            .await
            .map_err(|e| StreamError::Peer(format!("add ICE candidate: {}", e)))
    }

    async fn build_peer(self: &Arc<Self>) -> Result<Arc<RTCPeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| StreamError::Peer(format!("register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| StreamError::Peer(format!("register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let mut ice_servers = vec![];
        for stun_url in &self.ice.stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }
        for turn in &self.ice.turn_servers {
            ice_servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        let pc = api
            .new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .map_err(|e| StreamError::Peer(format!("create peer connection: {}", e)))?;
        let pc = Arc::new(pc);

        // Callbacks hold a Weak reference; the peer connection must not
        // keep its owning session alive.
        let weak = Arc::downgrade(self);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let weak = weak.clone();
            Box::pin(async move {
                if state == RTCPeerConnectionState::Failed {
                    if let Some(session) = weak.upgrade() {
                        session.fail("peer connection failed").await;
                    }
                }
            })
        }));

        let weak = Arc::downgrade(self);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let weak = weak.clone();
            Box::pin(async move {
                let (Some(candidate), Some(session)) = (candidate, weak.upgrade()) else {
                    return;
                };
                session.publish_local_candidate(candidate).await;
            })
        }));

        let weak = Arc::downgrade(self);
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(session) = weak.upgrade() {
                        session.enter_streaming(Some(track));
                    }
                })
            },
        ));

        Ok(pc)
    }

    /// Trickle ICE: publish each locally gathered candidate as it appears
    async fn publish_local_candidate(&self, candidate: RTCIceCandidate) {
        let init = match candidate.to_json() {
            Ok(init) => init,
            Err(e) => {
                debug!("Local candidate not serializable: {}", e);
                return;
            }
        };
        let payload = IceCandidatePayload {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        };
        if let Err(e) = self.send_with(SignalKind::Candidate, payload).await {
            debug!("Candidate not delivered: {}", e);
        }
    }

    /// First remote track: hand the media to the sink and go streaming
    fn enter_streaming(&self, track: Option<Arc<TrackRemote>>) {
        if self.state() == StreamState::Streaming {
            debug!("Session {} already streaming, extra track ignored", self.session_id);
            return;
        }
        if let Some(track) = track {
            info!(
                "Session {} received {} track from {}",
                self.session_id,
                track.kind(),
                self.device_id
            );
            self.sink.attach(track);
        }
        self.set_state(StreamState::Streaming);
        self.events.publish(StreamEvent::TrackReceived {
            device_id: self.device_id.clone(),
        });
    }

    async fn send(&self, kind: SignalKind) -> Result<()> {
        let msg = SignalMessage::new(kind, self.message_id.as_str(), self.reply_topic.as_str());
        self.broker
            .publish(&self.device_topic, msg.encode()?)
            .await
    }

    async fn send_with(&self, kind: SignalKind, payload: impl Serialize) -> Result<()> {
        let msg = SignalMessage::new(kind, self.message_id.as_str(), self.reply_topic.as_str())
            .with_data(payload)?;
        self.broker
            .publish(&self.device_topic, msg.encode()?)
            .await
    }

    async fn close_peer(&self) {
        if let Some(pc) = self.peer.lock().await.take() {
            if let Err(e) = pc.close().await {
                debug!("Closing peer connection: {}", e);
            }
        }
    }

    /// Unrecoverable failure: contained here, surfaced only through the
    /// status projection and the event bus.
    async fn fail(&self, message: &str) {
        warn!(
            "Session {} for {} failed: {}",
            self.session_id, self.device_id, message
        );
        self.close_peer().await;
        self.sink.detach();
        self.broker.unsubscribe(&self.reply_topic).await;
        self.status.send_replace(StreamStatus::failed(message));
        self.events.publish(StreamEvent::StateChanged {
            device_id: self.device_id.clone(),
            state: StreamState::Error,
        });
        self.events.publish(StreamEvent::StreamError {
            device_id: self.device_id.clone(),
            message: message.to_string(),
        });
    }

    fn set_state(&self, state: StreamState) {
        self.status.send_replace(StreamStatus::advance(state));
        self.events.publish(StreamEvent::StateChanged {
            device_id: self.device_id.clone(),
            state,
        });
    }
}
