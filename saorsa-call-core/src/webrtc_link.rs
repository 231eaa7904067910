//! ICE/STUN peer negotiation through the webrtc crate
//!
//! [`WebRtcNegotiator`] creates one `RTCPeerConnection` per call, adds a
//! local track per captured kind and runs the caller side of the handshake
//! over a [`SignalingHandler`]: offer out, then ringing, answer, trickled
//! candidates and bye in. A single router task reads the signaling channel
//! and hands each message to the negotiation it belongs to.

use crate::contact::{PeerContact, PeerId};
use crate::media::MediaHandle;
use crate::negotiator::{
    IceServerConfig, LinkEvent, LinkState, Negotiation, NegotiationError, NegotiatorConfig,
    PeerLink, PeerNegotiator, RemoteMediaHandle, RemoteTrack,
};
use crate::signaling::{SignalingError, SignalingHandler, SignalingMessage};
use crate::task::TaskGuard;
use crate::types::{CallId, LinkStats, MediaKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Map configured ICE servers onto webrtc's representation
fn ice_servers(config: &[IceServerConfig]) -> Vec<RTCIceServer> {
    config
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
    let mime_type = match kind {
        MediaKind::Audio => MIME_TYPE_OPUS,
        MediaKind::Video => MIME_TYPE_VP8,
    };
    RTCRtpCodecCapability {
        mime_type: mime_type.to_owned(),
        ..Default::default()
    }
}

fn media_kind(codec_type: RTPCodecType) -> Option<MediaKind> {
    match codec_type {
        RTPCodecType::Audio => Some(MediaKind::Audio),
        RTPCodecType::Video => Some(MediaKind::Video),
        _ => None,
    }
}

fn failed(context: &str, err: impl std::fmt::Display) -> NegotiationError {
    NegotiationError::Failed(format!("{}: {}", context, err))
}

// ============================================================================
// Signaling router
// ============================================================================

type Route = (PeerId, mpsc::Sender<SignalingMessage>);

/// Fans incoming signaling out to per-session inboxes
struct SignalingRouter {
    handler: Arc<SignalingHandler>,
    routes: Mutex<HashMap<String, Route>>,
    pump: Mutex<Option<TaskGuard>>,
}

impl SignalingRouter {
    fn new(handler: Arc<SignalingHandler>) -> Arc<Self> {
        Arc::new(Self {
            handler,
            routes: Mutex::new(HashMap::new()),
            pump: Mutex::new(None),
        })
    }

    fn register(
        self: &Arc<Self>,
        session_id: &str,
        peer: PeerId,
        capacity: usize,
    ) -> mpsc::Receiver<SignalingMessage> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.routes
            .lock()
            .insert(session_id.to_string(), (peer, tx));

        let mut pump = self.pump.lock();
        if !pump.as_ref().is_some_and(TaskGuard::is_active) {
            *pump = Some(TaskGuard::spawn(
                "signaling-router",
                route_incoming(Arc::clone(&self.handler), Arc::downgrade(self)),
            ));
        }
        rx
    }

    fn unregister(&self, session_id: &str) {
        self.routes.lock().remove(session_id);
    }

    fn route_for(&self, session_id: &str) -> Option<Route> {
        self.routes.lock().get(session_id).cloned()
    }
}

async fn route_incoming(handler: Arc<SignalingHandler>, router: Weak<SignalingRouter>) {
    loop {
        let (from, message) = match handler.receive_message().await {
            Ok(received) => received,
            Err(SignalingError::Closed) => {
                tracing::debug!("Signaling channel closed, router stopping");
                break;
            }
            // the handler already backed off
            Err(_) => continue,
        };
        let Some(router) = router.upgrade() else {
            break;
        };
        let session_id = message.session_id().to_string();
        match router.route_for(&session_id) {
            Some((peer, inbox)) if peer == from => {
                if inbox.send(message).await.is_err() {
                    router.unregister(&session_id);
                }
            }
            Some((peer, _)) => {
                tracing::warn!(
                    expected = %peer,
                    actual = %from,
                    "Dropping signaling message from unexpected peer"
                );
            }
            None => {
                tracing::debug!(
                    peer = %from,
                    session_id = %session_id,
                    message_type = message.kind(),
                    "No negotiation for signaling message"
                );
            }
        }
    }
}

// ============================================================================
// Link
// ============================================================================

struct LinkShared {
    state: Mutex<LinkState>,
    remote: Mutex<RemoteMediaHandle>,
}

impl LinkShared {
    fn set_state(&self, state: LinkState) -> bool {
        let mut current = self.state.lock();
        if *current == LinkState::Closed || *current == state {
            return false;
        }
        *current = state;
        true
    }
}

/// Peer link backed by an `RTCPeerConnection`
pub struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    peer: PeerId,
    session_id: String,
    signaling: Arc<SignalingHandler>,
    router: Arc<SignalingRouter>,
    shared: Arc<LinkShared>,
    task: Mutex<Option<TaskGuard>>,
    closed: AtomicBool,
}

#[async_trait]
impl PeerLink for WebRtcLink {
    fn negotiation_state(&self) -> LinkState {
        *self.shared.state.lock()
    }

    fn remote_media(&self) -> Option<RemoteMediaHandle> {
        let remote = self.shared.remote.lock();
        (!remote.tracks.is_empty()).then(|| remote.clone())
    }

    async fn stats(&self) -> Result<LinkStats, NegotiationError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NegotiationError::Closed);
        }
        let report = self.pc.get_stats().await;

        let mut rtt = None;
        let mut loss: Option<f64> = None;
        for stat in report.reports.values() {
            match stat {
                StatsReportType::CandidatePair(pair)
                    if pair.nominated && pair.current_round_trip_time > 0.0 =>
                {
                    rtt = Some(Duration::from_secs_f64(pair.current_round_trip_time));
                }
                StatsReportType::RemoteInboundRTP(remote) => {
                    loss = Some(loss.unwrap_or(0.0).max(remote.fraction_lost));
                    if rtt.is_none() {
                        rtt = remote
                            .round_trip_time
                            .filter(|secs| *secs > 0.0)
                            .map(Duration::from_secs_f64);
                    }
                }
                _ => {}
            }
        }

        Ok(LinkStats {
            packet_loss: loss.unwrap_or(0.0).clamp(0.0, 1.0) as f32,
            rtt,
            connected: self.pc.connection_state() == RTCPeerConnectionState::Connected,
        })
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut task) = self.task.lock().take() {
            task.cancel();
        }
        self.router.unregister(&self.session_id);
        *self.shared.state.lock() = LinkState::Closed;

        let bye = SignalingMessage::Bye {
            session_id: self.session_id.clone(),
            reason: None,
        };
        if let Err(e) = self.signaling.send_message(&self.peer, bye).await {
            tracing::debug!(error = %e, "Could not deliver bye");
        }
        if let Err(e) = self.pc.close().await {
            tracing::warn!(session_id = %self.session_id, error = %e, "Peer connection close failed");
        }
        tracing::debug!(session_id = %self.session_id, "WebRTC link closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// ============================================================================
// Negotiator
// ============================================================================

/// Caller-side negotiator over ICE/STUN
pub struct WebRtcNegotiator {
    config: NegotiatorConfig,
    signaling: Arc<SignalingHandler>,
    router: Arc<SignalingRouter>,
}

impl WebRtcNegotiator {
    /// Create a negotiator sending its handshake through `signaling`
    #[must_use]
    pub fn new(config: NegotiatorConfig, signaling: Arc<SignalingHandler>) -> Self {
        Self {
            config,
            router: SignalingRouter::new(Arc::clone(&signaling)),
            signaling,
        }
    }

    async fn peer_connection(&self) -> Result<Arc<RTCPeerConnection>, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| NegotiationError::ConfigError(format!("codec registration: {}", e)))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| NegotiationError::ConfigError(format!("interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers(&self.config.ice_servers),
            ..Default::default()
        };
        let pc = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| NegotiationError::ConfigError(format!("peer connection: {}", e)))?;
        Ok(Arc::new(pc))
    }
}

#[async_trait]
impl PeerNegotiator for WebRtcNegotiator {
    #[tracing::instrument(skip(self, peer, media), fields(peer = %peer.identity))]
    async fn connect(
        &self,
        call_id: CallId,
        peer: &PeerContact,
        media: &MediaHandle,
    ) -> Result<Negotiation, NegotiationError> {
        let pc = self.peer_connection().await?;
        let session_id = call_id.to_string();

        for (kind, track_id) in media.track_ids() {
            let track: Arc<dyn TrackLocal + Send + Sync> = Arc::new(TrackLocalStaticSample::new(
                codec_for(kind),
                track_id,
                session_id.clone(),
            ));
            pc.add_track(track)
                .await
                .map_err(|e| failed("add local track", e))?;
        }

        let (events_tx, events_rx) = mpsc::channel(self.config.event_capacity.max(1));
        let shared = Arc::new(LinkShared {
            state: Mutex::new(LinkState::New),
            remote: Mutex::new(RemoteMediaHandle::default()),
        });
        install_handlers(
            &pc,
            &shared,
            &events_tx,
            Arc::clone(&self.signaling),
            peer.identity.clone(),
            session_id.clone(),
        );

        let inbox = self.router.register(
            &session_id,
            peer.identity.clone(),
            self.config.event_capacity,
        );
        let task = TaskGuard::spawn(
            "webrtc-negotiation",
            negotiate(
                Arc::clone(&pc),
                Arc::clone(&self.signaling),
                peer.identity.clone(),
                session_id.clone(),
                inbox,
                Arc::clone(&shared),
                events_tx,
            ),
        );

        tracing::debug!(call_id = %call_id, tracks = media.track_ids().len(), "WebRTC negotiation started");
        let link = Arc::new(WebRtcLink {
            pc,
            peer: peer.identity.clone(),
            session_id,
            signaling: Arc::clone(&self.signaling),
            router: Arc::clone(&self.router),
            shared,
            task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
        });
        Ok(Negotiation {
            link,
            events: events_rx,
        })
    }
}

fn install_handlers(
    pc: &Arc<RTCPeerConnection>,
    shared: &Arc<LinkShared>,
    events: &mpsc::Sender<LinkEvent>,
    signaling: Arc<SignalingHandler>,
    peer: PeerId,
    session_id: String,
) {
    let state_shared = Arc::clone(shared);
    let state_events = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let shared = Arc::clone(&state_shared);
        let events = state_events.clone();
        Box::pin(async move {
            let (state, event) = match s {
                RTCPeerConnectionState::Connected => {
                    let remote = shared.remote.lock().clone();
                    (LinkState::Connected, LinkEvent::Connected { remote })
                }
                RTCPeerConnectionState::Disconnected => {
                    (LinkState::Disconnected, LinkEvent::Disconnected)
                }
                RTCPeerConnectionState::Failed => (
                    LinkState::Failed,
                    LinkEvent::Failed("ICE connectivity failed".to_string()),
                ),
                RTCPeerConnectionState::Closed => (LinkState::Closed, LinkEvent::Closed),
                _ => return,
            };
            tracing::debug!(state = ?state, "Peer connection state changed");
            if shared.set_state(state) {
                let _ = events.send(event).await;
            }
        })
    }));

    let track_shared = Arc::clone(shared);
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let shared = Arc::clone(&track_shared);
            Box::pin(async move {
                let Some(kind) = media_kind(track.kind()) else {
                    return;
                };
                let id = track.id().to_string();
                tracing::debug!(kind = %kind, track_id = %id, "Remote track received");
                shared.remote.lock().tracks.push(RemoteTrack { kind, id });
            })
        },
    ));

    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let signaling = Arc::clone(&signaling);
        let peer = peer.clone();
        let session_id = session_id.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            let init = match candidate.to_json() {
                Ok(init) => init,
                Err(e) => {
                    tracing::warn!(error = %e, "Could not serialize local ICE candidate");
                    return;
                }
            };
            let message = SignalingMessage::IceCandidate {
                session_id,
                candidate: init.candidate,
                sdp_mid: init.sdp_mid,
                sdp_mline_index: init.sdp_mline_index,
            };
            if let Err(e) = signaling.send_message(&peer, message).await {
                tracing::warn!(error = %e, "Failed to send local ICE candidate");
            }
        })
    }));
}

async fn negotiate(
    pc: Arc<RTCPeerConnection>,
    signaling: Arc<SignalingHandler>,
    peer: PeerId,
    session_id: String,
    inbox: mpsc::Receiver<SignalingMessage>,
    shared: Arc<LinkShared>,
    events: mpsc::Sender<LinkEvent>,
) {
    if let Err(e) = run_handshake(&pc, &signaling, &peer, &session_id, inbox, &shared, &events).await
    {
        tracing::warn!(session_id = %session_id, error = %e, "Negotiation failed");
        if shared.set_state(LinkState::Failed) {
            let _ = events.send(LinkEvent::Failed(e.to_string())).await;
        }
    }
}

async fn run_handshake(
    pc: &RTCPeerConnection,
    signaling: &SignalingHandler,
    peer: &PeerId,
    session_id: &str,
    mut inbox: mpsc::Receiver<SignalingMessage>,
    shared: &LinkShared,
    events: &mpsc::Sender<LinkEvent>,
) -> Result<(), NegotiationError> {
    let offer = pc
        .create_offer(None)
        .await
        .map_err(|e| failed("create offer", e))?;
    pc.set_local_description(offer.clone())
        .await
        .map_err(|e| failed("set local description", e))?;
    signaling
        .send_message(
            peer,
            SignalingMessage::Offer {
                session_id: session_id.to_string(),
                sdp: offer.sdp,
            },
        )
        .await?;

    shared.set_state(LinkState::Connecting);
    if events.send(LinkEvent::Connecting).await.is_err() {
        return Ok(());
    }

    while let Some(message) = inbox.recv().await {
        match message {
            SignalingMessage::Ringing { .. } => {
                if events.send(LinkEvent::Ringing).await.is_err() {
                    break;
                }
            }
            SignalingMessage::Answer { sdp, .. } => {
                let answer =
                    RTCSessionDescription::answer(sdp).map_err(|e| failed("parse answer", e))?;
                pc.set_remote_description(answer)
                    .await
                    .map_err(|e| failed("set remote description", e))?;
                tracing::debug!("Remote answer applied");
            }
            SignalingMessage::IceCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
                ..
            } => {
                let init = RTCIceCandidateInit {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                    username_fragment: None,
                };
                if let Err(e) = pc.add_ice_candidate(init).await {
                    // one bad candidate does not sink the negotiation
                    tracing::warn!(error = %e, "Rejected remote ICE candidate");
                }
            }
            SignalingMessage::Bye { reason, .. } => {
                tracing::info!(reason = ?reason, "Remote hung up");
                let _ = events.send(LinkEvent::RemoteHangup { reason }).await;
                break;
            }
            SignalingMessage::Offer { .. } => {
                tracing::warn!("Ignoring offer on an outgoing call");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::signaling::{MemorySignaling, SignalingTransport};

    #[test]
    fn test_ice_server_mapping() {
        let servers = ice_servers(&[
            IceServerConfig::stun("stun:stun.example.org:3478"),
            IceServerConfig {
                urls: vec!["turn:turn.example.org:3478".to_string()],
                username: Some("user".to_string()),
                credential: Some("secret".to_string()),
            },
        ]);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.example.org:3478"]);
        assert!(servers[0].username.is_empty());
        assert_eq!(servers[1].username, "user");
        assert_eq!(servers[1].credential, "secret");
    }

    #[test]
    fn test_codec_per_kind() {
        assert_eq!(codec_for(MediaKind::Audio).mime_type, MIME_TYPE_OPUS);
        assert_eq!(codec_for(MediaKind::Video).mime_type, MIME_TYPE_VP8);
        assert_eq!(media_kind(RTPCodecType::Audio), Some(MediaKind::Audio));
        assert_eq!(media_kind(RTPCodecType::Unspecified), None);
    }

    #[tokio::test]
    async fn test_router_delivers_by_session_and_peer() {
        let (alice, bob) = MemorySignaling::pair("alice", "bob");
        let router = SignalingRouter::new(Arc::new(SignalingHandler::new(Arc::new(alice))));
        let mut inbox = router.register("call-1", PeerId::new("bob"), 8);

        let alice_id = PeerId::new("alice");
        bob.send_message(
            &alice_id,
            SignalingMessage::Ringing {
                session_id: "other-call".to_string(),
            },
        )
        .await
        .unwrap();
        bob.send_message(
            &alice_id,
            SignalingMessage::Ringing {
                session_id: "call-1".to_string(),
            },
        )
        .await
        .unwrap();

        let message = tokio::time::timeout(Duration::from_secs(5), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.session_id(), "call-1");

        router.unregister("call-1");
        assert!(router.route_for("call-1").is_none());
    }
}
