//! Peer link negotiation
//!
//! A [`PeerNegotiator`] turns local media into a [`PeerLink`] to the remote
//! participant. `connect` returns as soon as negotiation has been started;
//! progress is reported as an ordered stream of [`LinkEvent`]s which the
//! call controller maps onto session states.
//!
//! # Implementations
//!
//! - `WebRtcNegotiator` - ICE/STUN negotiation via the webrtc crate
//!   (requires the `webrtc-transport` feature)
//! - [`LoopbackNegotiator`](crate::loopback::LoopbackNegotiator) - in-process
//!   simulated remote peer

use crate::contact::PeerContact;
use crate::media::MediaHandle;
use crate::types::{CallId, LinkStats, MediaKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Negotiation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// Peer connection could not be created or configured
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Offer/answer exchange failed
    #[error("Negotiation failed: {0}")]
    Failed(String),

    /// Signaling channel failed
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Link already closed
    #[error("Link closed")]
    Closed,
}

impl From<crate::signaling::SignalingError> for NegotiationError {
    fn from(err: crate::signaling::SignalingError) -> Self {
        NegotiationError::Signaling(err.to_string())
    }
}

/// Negotiation state of a peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// Created, nothing sent yet
    New,
    /// Offer out, candidates being exchanged
    Connecting,
    /// Transport up and answer applied
    Connected,
    /// Transport lost after connecting
    Disconnected,
    /// Negotiation or transport failed
    Failed,
    /// Closed locally or remotely
    Closed,
}

/// Incoming track announced by the remote peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    /// Track kind
    pub kind: MediaKind,
    /// Remote track id
    pub id: String,
}

/// Handle to the remote participant's incoming media
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteMediaHandle {
    /// Tracks received so far
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteMediaHandle {
    /// Whether the remote sends a track of this kind
    #[must_use]
    pub fn has(&self, kind: MediaKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

/// Progress reported by a negotiation
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Offer sent, candidates being gathered
    Connecting,
    /// Remote side is alerting its user
    Ringing,
    /// Answer applied and transport connected
    Connected {
        /// Remote media bound to incoming tracks
        remote: RemoteMediaHandle,
    },
    /// Transport lost
    Disconnected,
    /// Negotiation or transport failed
    Failed(String),
    /// Link closed
    Closed,
    /// Remote participant hung up or declined
    RemoteHangup {
        /// Reason given by the remote, if any
        reason: Option<String>,
    },
}

/// A negotiated (or negotiating) transport channel to the remote peer
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Current negotiation state
    fn negotiation_state(&self) -> LinkState;

    /// Remote media, available once connected
    fn remote_media(&self) -> Option<RemoteMediaHandle>;

    /// Current link statistics
    async fn stats(&self) -> Result<LinkStats, NegotiationError>;

    /// Tear the link down
    ///
    /// Idempotent; cancels any in-flight negotiation instead of waiting for it.
    async fn close(&self);

    /// Whether `close` has run
    fn is_closed(&self) -> bool {
        self.negotiation_state() == LinkState::Closed
    }
}

/// A started negotiation
pub struct Negotiation {
    /// The link being negotiated
    pub link: Arc<dyn PeerLink>,
    /// Ordered progress events; ends when negotiation stops producing events
    pub events: mpsc::Receiver<LinkEvent>,
}

/// Establishes peer links
#[async_trait]
pub trait PeerNegotiator: Send + Sync {
    /// Start negotiating a link for `call_id` carrying `media`
    ///
    /// The handle is only borrowed to describe local tracks; the negotiator
    /// must not keep it.
    async fn connect(
        &self,
        call_id: CallId,
        peer: &PeerContact,
        media: &MediaHandle,
    ) -> Result<Negotiation, NegotiationError>;
}

/// ICE server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// `stun:` or `turn:` URLs
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default)]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// STUN server without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Negotiator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatorConfig {
    /// NAT traversal servers; at least two are expected
    pub ice_servers: Vec<IceServerConfig>,
    /// Capacity of the link event channel
    pub event_capacity: usize,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServerConfig::stun("stun:stun.l.google.com:19302"),
                IceServerConfig::stun("stun:stun1.l.google.com:19302"),
            ],
            event_capacity: 32,
        }
    }
}
