//! Call signaling protocol
//!
//! Carries the call-setup handshake between two endpoints: offer, ringing,
//! answer, ICE candidates and hang-up. The wire transport (DHT, gossip,
//! a relay server, ...) is an external collaborator behind
//! [`SignalingTransport`].

use crate::contact::PeerId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Instant};

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Message failed validation
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Remote end of the channel is gone
    #[error("Signaling channel closed")]
    Closed,
}

/// Signaling message types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// SDP offer from the caller
    Offer {
        /// Session ID
        session_id: String,
        /// SDP content
        sdp: String,
    },

    /// Callee is alerting its user
    Ringing {
        /// Session ID
        session_id: String,
    },

    /// SDP answer, sent once the callee accepted
    Answer {
        /// Session ID
        session_id: String,
        /// SDP content
        sdp: String,
    },

    /// Trickled ICE candidate
    IceCandidate {
        /// Session ID
        session_id: String,
        /// Candidate string
        candidate: String,
        /// SDP mid
        sdp_mid: Option<String>,
        /// SDP mline index
        sdp_mline_index: Option<u16>,
    },

    /// Hang up / decline
    Bye {
        /// Session ID
        session_id: String,
        /// Optional reason
        reason: Option<String>,
    },
}

impl SignalingMessage {
    /// Get the session ID
    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::Offer { session_id, .. }
            | Self::Ringing { session_id }
            | Self::Answer { session_id, .. }
            | Self::IceCandidate { session_id, .. }
            | Self::Bye { session_id, .. } => session_id,
        }
    }

    /// Short message type name for tracing
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "Offer",
            Self::Ringing { .. } => "Ringing",
            Self::Answer { .. } => "Answer",
            Self::IceCandidate { .. } => "IceCandidate",
            Self::Bye { .. } => "Bye",
        }
    }

    /// Structural validation applied before a message is handed to a negotiator
    ///
    /// # Errors
    ///
    /// Returns `InvalidMessage` for empty session ids, empty SDP or empty candidates
    pub fn validate(&self) -> Result<(), SignalingError> {
        if self.session_id().trim().is_empty() {
            return Err(SignalingError::InvalidMessage(
                "session id cannot be empty".to_string(),
            ));
        }
        match self {
            Self::Offer { sdp, .. } | Self::Answer { sdp, .. } if sdp.trim().is_empty() => Err(
                SignalingError::InvalidMessage("SDP cannot be empty".to_string()),
            ),
            Self::IceCandidate { candidate, .. } if candidate.trim().is_empty() => Err(
                SignalingError::InvalidMessage("ICE candidate cannot be empty".to_string()),
            ),
            _ => Ok(()),
        }
    }

    /// Encode as JSON
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::InvalidMessage(e.to_string()))
    }

    /// Decode and validate a JSON message
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or the message is invalid
    pub fn from_json(json: &str) -> Result<Self, SignalingError> {
        let message: Self =
            serde_json::from_str(json).map_err(|e| SignalingError::InvalidMessage(e.to_string()))?;
        message.validate()?;
        Ok(message)
    }
}

/// Signaling transport trait
///
/// Implement this for your specific transport. Must deliver an offer, deliver
/// an answer, deliver ICE candidates and notify of remote hang-up.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Send a signaling message to a peer
    async fn send_message(
        &self,
        peer: &PeerId,
        message: SignalingMessage,
    ) -> Result<(), SignalingError>;

    /// Receive the next signaling message
    async fn receive_message(&self) -> Result<(PeerId, SignalingMessage), SignalingError>;
}

/// Minimum time between messages (10ms for 100 msg/sec rate limit)
const MIN_MESSAGE_INTERVAL: Duration = Duration::from_millis(10);

/// Signaling handler with validation, rate limiting and error backoff
pub struct SignalingHandler {
    transport: Arc<dyn SignalingTransport>,
    last_receive_time: Mutex<Instant>,
    error_count: Mutex<u32>,
}

impl SignalingHandler {
    /// Create new signaling handler
    #[must_use]
    pub fn new(transport: Arc<dyn SignalingTransport>) -> Self {
        Self {
            transport,
            last_receive_time: Mutex::new(Instant::now()),
            error_count: Mutex::new(0),
        }
    }

    /// Send a signaling message to a peer
    ///
    /// # Errors
    ///
    /// Returns error if the message is invalid or sending fails
    #[tracing::instrument(skip(self, message), fields(peer = %peer, message_type = message.kind()))]
    pub async fn send_message(
        &self,
        peer: &PeerId,
        message: SignalingMessage,
    ) -> Result<(), SignalingError> {
        message.validate()?;
        tracing::debug!("Sending signaling message");
        self.transport.send_message(peer, message).await
    }

    /// Receive a signaling message with rate limiting and backpressure
    ///
    /// Invalid messages are dropped with a warning and the next one is awaited.
    ///
    /// # Errors
    ///
    /// Returns error if receiving fails
    #[tracing::instrument(skip(self))]
    pub async fn receive_message(&self) -> Result<(PeerId, SignalingMessage), SignalingError> {
        loop {
            self.pace().await;

            match self.transport.receive_message().await {
                Ok((peer, message)) => {
                    *self.error_count.lock().await = 0;
                    if let Err(e) = message.validate() {
                        tracing::warn!(peer = %peer, error = %e, "Dropping invalid signaling message");
                        continue;
                    }
                    tracing::debug!(peer = %peer, message_type = message.kind(), "Received signaling message");
                    return Ok((peer, message));
                }
                Err(SignalingError::Closed) => return Err(SignalingError::Closed),
                Err(e) => {
                    let count = {
                        let mut error_count = self.error_count.lock().await;
                        *error_count += 1;
                        *error_count
                    };
                    let backoff_duration = Duration::from_millis(100 * u64::from(count.min(10)));
                    tracing::warn!(
                        error_count = count,
                        backoff_ms = backoff_duration.as_millis(),
                        "Error receiving message, applying exponential backoff"
                    );
                    sleep(backoff_duration).await;
                    return Err(e);
                }
            }
        }
    }

    async fn pace(&self) {
        let mut last_time = self.last_receive_time.lock().await;
        let elapsed = last_time.elapsed();
        if elapsed < MIN_MESSAGE_INTERVAL {
            let sleep_duration = MIN_MESSAGE_INTERVAL - elapsed;
            tracing::trace!(
                sleep_ms = sleep_duration.as_millis(),
                "Rate limiting applied"
            );
            sleep(sleep_duration).await;
        }
        *last_time = Instant::now();
    }
}

/// In-process signaling endpoint
///
/// [`MemorySignaling::pair`] returns two endpoints wired back to back; what
/// one sends the other receives, tagged with the sender's identity.
pub struct MemorySignaling {
    local: PeerId,
    outgoing: mpsc::UnboundedSender<(PeerId, SignalingMessage)>,
    incoming: Mutex<mpsc::UnboundedReceiver<(PeerId, SignalingMessage)>>,
}

impl MemorySignaling {
    /// Two connected endpoints for peers `a` and `b`
    #[must_use]
    pub fn pair(a: impl Into<PeerId>, b: impl Into<PeerId>) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                local: a.into(),
                outgoing: b_tx,
                incoming: Mutex::new(a_rx),
            },
            Self {
                local: b.into(),
                outgoing: a_tx,
                incoming: Mutex::new(b_rx),
            },
        )
    }

    /// This endpoint's identity
    #[must_use]
    pub fn local_id(&self) -> &PeerId {
        &self.local
    }
}

#[async_trait]
impl SignalingTransport for MemorySignaling {
    async fn send_message(
        &self,
        _peer: &PeerId,
        message: SignalingMessage,
    ) -> Result<(), SignalingError> {
        self.outgoing
            .send((self.local.clone(), message))
            .map_err(|_| SignalingError::Closed)
    }

    async fn receive_message(&self) -> Result<(PeerId, SignalingMessage), SignalingError> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(SignalingError::Closed)
    }
}
