//! Caller-side WebRTC negotiation against an in-process callee
//!
//! The callee is a plain `RTCPeerConnection` driven over `MemorySignaling`.
//! No ICE servers are configured, so the peers connect over host candidates
//! and the tests need no network beyond the local interfaces.

#![cfg(feature = "webrtc-transport")]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use saorsa_call_core::{
    CallId, CallType, LinkEvent, LinkState, MediaResourceManager, MemorySignaling,
    NegotiationError, NegotiatorConfig, PeerContact, PeerId, PeerLink, PeerNegotiator,
    SignalingHandler, SignalingMessage, SignalingTransport, VirtualCaptureBackend,
    WebRtcNegotiator,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

async fn plain_peer_connection() -> RTCPeerConnection {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().unwrap();
    let registry = register_default_interceptors(Registry::new(), &mut media_engine).unwrap();
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();
    api.new_peer_connection(RTCConfiguration::default())
        .await
        .unwrap()
}

/// Run the callee side on `signaling`; every message it receives is forwarded
/// to the returned channel
///
/// The callee always reports ringing. With `answer` it then accepts the offer;
/// without it the call rings until the caller gives up.
fn spawn_callee(
    signaling: MemorySignaling,
    answer: bool,
) -> mpsc::UnboundedReceiver<SignalingMessage> {
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let caller = PeerId::new("alice");
        let pc = plain_peer_connection().await;

        let (local_tx, mut local_rx) = mpsc::unbounded_channel::<RTCIceCandidateInit>();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let local_tx = local_tx.clone();
            Box::pin(async move {
                if let Some(init) = candidate.and_then(|c| c.to_json().ok()) {
                    let _ = local_tx.send(init);
                }
            })
        }));

        let mut session_id = String::new();
        let mut answered = false;
        // candidates that arrive before the offer is applied
        let mut early: Vec<RTCIceCandidateInit> = Vec::new();

        loop {
            tokio::select! {
                received = signaling.receive_message() => {
                    let Ok((_, message)) = received else {
                        break;
                    };
                    let _ = seen_tx.send(message.clone());
                    match message {
                        SignalingMessage::Offer { session_id: id, sdp } => {
                            session_id = id.clone();
                            let ringing = SignalingMessage::Ringing { session_id: id.clone() };
                            signaling.send_message(&caller, ringing).await.unwrap();
                            if !answer {
                                continue;
                            }
                            pc.set_remote_description(RTCSessionDescription::offer(sdp).unwrap())
                                .await
                                .unwrap();
                            let local = pc.create_answer(None).await.unwrap();
                            pc.set_local_description(local.clone()).await.unwrap();
                            let reply = SignalingMessage::Answer { session_id: id, sdp: local.sdp };
                            signaling.send_message(&caller, reply).await.unwrap();
                            answered = true;
                            for init in early.drain(..) {
                                let _ = pc.add_ice_candidate(init).await;
                            }
                        }
                        SignalingMessage::IceCandidate { candidate, sdp_mid, sdp_mline_index, .. } => {
                            let init = RTCIceCandidateInit {
                                candidate,
                                sdp_mid,
                                sdp_mline_index,
                                username_fragment: None,
                            };
                            if answered {
                                let _ = pc.add_ice_candidate(init).await;
                            } else {
                                early.push(init);
                            }
                        }
                        // keep listening so a repeated bye would still be seen
                        SignalingMessage::Bye { .. } => {
                            let _ = pc.close().await;
                        }
                        SignalingMessage::Ringing { .. } | SignalingMessage::Answer { .. } => {}
                    }
                }
                // the caller drops candidates that precede the answer
                Some(init) = local_rx.recv(), if answered => {
                    let message = SignalingMessage::IceCandidate {
                        session_id: session_id.clone(),
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    };
                    if signaling.send_message(&caller, message).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = pc.close().await;
    });
    seen_rx
}

struct Caller {
    negotiator: WebRtcNegotiator,
    backend: VirtualCaptureBackend,
}

fn caller(signaling: MemorySignaling) -> Caller {
    let config = NegotiatorConfig {
        ice_servers: vec![],
        ..NegotiatorConfig::default()
    };
    Caller {
        negotiator: WebRtcNegotiator::new(
            config,
            Arc::new(SignalingHandler::new(Arc::new(signaling))),
        ),
        backend: VirtualCaptureBackend::new(),
    }
}

async fn wait_for_bye(seen: &mut mpsc::UnboundedReceiver<SignalingMessage>) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match seen.recv().await {
                Some(SignalingMessage::Bye { .. }) => break,
                Some(_) => {}
                None => panic!("callee stopped before the bye"),
            }
        }
    })
    .await
    .expect("no bye delivered");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn answered_offer_connects_and_closes_once() {
    init_tracing();
    let (alice, bob) = MemorySignaling::pair("alice", "bob");
    let mut seen = spawn_callee(bob, true);
    let caller = caller(alice);
    let media = MediaResourceManager::new(Arc::new(caller.backend.clone()))
        .acquire(CallType::Voice)
        .await
        .unwrap();

    let mut negotiation = caller
        .negotiator
        .connect(CallId::new(), &PeerContact::new("bob"), &media)
        .await
        .unwrap();

    let events = tokio::time::timeout(Duration::from_secs(30), async {
        let mut events = Vec::new();
        while let Some(event) = negotiation.events.recv().await {
            let connected = matches!(event, LinkEvent::Connected { .. });
            events.push(event);
            if connected {
                break;
            }
        }
        events
    })
    .await
    .expect("never connected");

    assert_eq!(events.len(), 3, "{:?}", events);
    assert_eq!(events[0], LinkEvent::Connecting);
    assert_eq!(events[1], LinkEvent::Ringing);
    assert!(matches!(events[2], LinkEvent::Connected { .. }));

    let link = negotiation.link;
    assert_eq!(link.negotiation_state(), LinkState::Connected);
    assert!(link.stats().await.unwrap().connected);

    link.close().await;
    wait_for_bye(&mut seen).await;
    assert!(link.is_closed());
    assert_eq!(link.negotiation_state(), LinkState::Closed);
    assert_eq!(link.stats().await, Err(NegotiationError::Closed));

    link.close().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(message) = seen.try_recv() {
        assert!(
            !matches!(message, SignalingMessage::Bye { .. }),
            "second bye sent"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_while_ringing_sends_bye_and_never_connects() {
    init_tracing();
    let (alice, bob) = MemorySignaling::pair("alice", "bob");
    let mut seen = spawn_callee(bob, false);
    let caller = caller(alice);
    let media = MediaResourceManager::new(Arc::new(caller.backend.clone()))
        .acquire(CallType::Video)
        .await
        .unwrap();

    let mut negotiation = caller
        .negotiator
        .connect(CallId::new(), &PeerContact::new("bob"), &media)
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = negotiation.events.recv().await {
            if event == LinkEvent::Ringing {
                return;
            }
        }
        panic!("event stream ended before ringing");
    })
    .await
    .expect("never rang");

    negotiation.link.close().await;
    wait_for_bye(&mut seen).await;
    assert_eq!(negotiation.link.negotiation_state(), LinkState::Closed);
    assert_eq!(
        negotiation.link.stats().await,
        Err(NegotiationError::Closed)
    );

    // the stream may end or stay open; either way it never reports a connection
    let _ = tokio::time::timeout(Duration::from_secs(1), async {
        while let Some(event) = negotiation.events.recv().await {
            assert!(
                !matches!(event, LinkEvent::Connected { .. }),
                "connected after close"
            );
        }
    })
    .await;
    assert!(negotiation.link.is_closed());
}
