//! Call session types and data structures

use crate::contact::PeerContact;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for one call attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// Audio only
    Voice,
    /// Audio and video
    Video,
}

impl CallType {
    /// Capture devices this call type needs
    #[must_use]
    pub fn required_kinds(self) -> MediaKinds {
        match self {
            Self::Voice => MediaKinds::AUDIO,
            Self::Video => MediaKinds::AUDIO_VIDEO,
        }
    }

    /// Whether video commands apply to this call type
    #[must_use]
    pub fn has_video(self) -> bool {
        matches!(self, Self::Video)
    }
}

impl std::fmt::Display for CallType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Voice => write!(f, "voice"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Call state enumeration
///
/// ```text
///   Idle ─► Initializing ─► Connecting ─► Ringing ─► Connected ─► Ended
///                │               │           │                     ▲
///                ├───────────────┴───────────┴──► Failed           │
///                └───────────────┴───────────┴─────────────────────┘
///                                    (caller cancel)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// Session created, nothing acquired yet
    Idle,
    /// Acquiring capture devices
    Initializing,
    /// Negotiating the peer link
    Connecting,
    /// Offer delivered, remote side alerting
    Ringing,
    /// Media flowing
    Connected,
    /// Call finished normally or was cancelled
    Ended,
    /// Call failed before connecting
    Failed,
}

impl CallState {
    /// Check whether `self -> to` is an edge of the session state machine
    #[must_use]
    pub fn can_transition_to(self, to: CallState) -> bool {
        use CallState::{Connected, Connecting, Ended, Failed, Idle, Initializing, Ringing};
        matches!(
            (self, to),
            (Idle, Initializing)
                | (Initializing, Connecting)
                | (Connecting, Ringing)
                | (Ringing, Connected)
                | (Connected, Ended)
                | (Initializing | Connecting | Ringing, Failed)
                | (Initializing | Connecting | Ringing, Ended)
        )
    }

    /// `Ended` and `Failed` have no outgoing edges
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }

    /// States in which negotiation or acquisition may still be in flight
    #[must_use]
    pub fn is_setup(self) -> bool {
        matches!(self, Self::Initializing | Self::Connecting | Self::Ringing)
    }
}

/// Local capture track kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Microphone
    Audio,
    /// Camera
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Set of media kinds (the handle's kind mask)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaKinds {
    /// Audio requested/present
    pub audio: bool,
    /// Video requested/present
    pub video: bool,
}

impl MediaKinds {
    /// Audio only
    pub const AUDIO: Self = Self {
        audio: true,
        video: false,
    };

    /// Audio and video
    pub const AUDIO_VIDEO: Self = Self {
        audio: true,
        video: true,
    };

    /// Check membership
    #[must_use]
    pub fn contains(self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio,
            MediaKind::Video => self.video,
        }
    }

    /// Kinds in acquisition order (audio first)
    #[must_use]
    pub fn iter(self) -> impl Iterator<Item = MediaKind> {
        [MediaKind::Audio, MediaKind::Video]
            .into_iter()
            .filter(move |kind| self.contains(*kind))
    }
}

/// Enabled flags of the session's local tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFlags {
    /// Microphone track enabled (false = muted)
    pub audio_enabled: bool,
    /// Camera track enabled; `None` for voice calls
    pub video_enabled: Option<bool>,
}

/// Connection health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityClass {
    /// Negligible loss, low latency
    Excellent,
    /// Usable with minor impairment
    Good,
    /// Noticeably impaired
    Poor,
    /// No media getting through
    Disconnected,
}

impl std::fmt::Display for QualityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Excellent => write!(f, "excellent"),
            Self::Good => write!(f, "good"),
            Self::Poor => write!(f, "poor"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Raw link statistics read from a peer link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkStats {
    /// Fraction of packets lost, 0.0..=1.0
    pub packet_loss: f32,
    /// Round-trip time, if measured yet
    pub rtt: Option<Duration>,
    /// Whether the transport currently considers itself connected
    pub connected: bool,
}

impl LinkStats {
    /// Stats for a healthy link
    #[must_use]
    pub fn healthy(rtt: Duration) -> Self {
        Self {
            packet_loss: 0.0,
            rtt: Some(rtt),
            connected: true,
        }
    }

    /// Stats for a link that lost connectivity
    #[must_use]
    pub fn lost() -> Self {
        Self {
            packet_loss: 1.0,
            rtt: None,
            connected: false,
        }
    }
}

/// One quality observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualitySample {
    /// When the sample was taken
    pub timestamp: DateTime<Utc>,
    /// Classification produced by the active policy
    pub classification: QualityClass,
    /// Stats the classification was derived from (`None` if reading failed)
    pub stats: Option<LinkStats>,
}

/// Why a session ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// User or platform refused device access
    PermissionDenied,
    /// No capture device of a required kind
    DeviceNotFound,
    /// Device held by another application
    DeviceBusy,
    /// Transport negotiation failed
    NegotiationFailed(String),
    /// Remote side never completed the handshake in time
    SignalingTimeout,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::DeviceNotFound => write!(f, "device not found"),
            Self::DeviceBusy => write!(f, "device busy"),
            Self::NegotiationFailed(detail) => write!(f, "negotiation failed: {}", detail),
            Self::SignalingTimeout => write!(f, "signaling timeout"),
        }
    }
}

/// Why a session ended in `Ended`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Caller ended before the call connected
    UserCancelled,
    /// Caller hung up a connected call
    LocalHangup,
    /// Remote participant hung up
    RemoteHangup,
    /// Transport dropped while connected
    LinkLost,
    /// Control surface was disposed mid-call
    Disposed,
}

/// Non-error result of a control command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandOutcome {
    /// Command applied
    Done,
    /// Session was already in a terminal state
    AlreadyEnded,
    /// Command needs a connected call
    NotConnected,
    /// Track toggled; carries the new enabled state
    Track {
        /// Track affected
        kind: MediaKind,
        /// Enabled after the command
        enabled: bool,
    },
}

/// Call session information, owned by the controller
#[derive(Debug, Clone)]
pub struct CallSession {
    /// Call identifier
    pub id: CallId,
    /// Remote participant
    pub peer: PeerContact,
    /// Voice or video
    pub call_type: CallType,
    /// Current state
    pub state: CallState,
    /// Set when the session entered `Failed`
    pub failure_reason: Option<FailureReason>,
    /// Set when the session entered `Ended`
    pub end_reason: Option<EndReason>,
    /// Creation timestamp
    pub started_at: DateTime<Utc>,
    /// When `Connected` was entered
    pub connected_at: Option<DateTime<Utc>>,
    /// When a terminal state was entered
    pub ended_at: Option<DateTime<Utc>>,
    /// Seconds spent in `Connected`
    pub duration_seconds: u64,
    /// Latest quality classification
    pub quality: Option<QualityClass>,
    /// Local track flags, present while media is held
    pub media: Option<MediaFlags>,
}

impl CallSession {
    /// Create a new session in `Idle`
    pub fn new(peer: PeerContact, call_type: CallType) -> Self {
        Self {
            id: CallId::new(),
            peer,
            call_type,
            state: CallState::Idle,
            failure_reason: None,
            end_reason: None,
            started_at: Utc::now(),
            connected_at: None,
            ended_at: None,
            duration_seconds: 0,
            quality: None,
            media: None,
        }
    }

    /// Snapshot for the state stream
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            call_id: Some(self.id),
            peer: Some(self.peer.identity.to_string()),
            call_type: Some(self.call_type),
            state: self.state,
            failure_reason: self.failure_reason.clone(),
            end_reason: self.end_reason,
            quality: self.quality,
            duration_seconds: self.duration_seconds,
            media: self.media,
        }
    }
}

/// Value published on the session state stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Current call, `None` before the first `start`
    pub call_id: Option<CallId>,
    /// Remote identity
    pub peer: Option<String>,
    /// Voice or video
    pub call_type: Option<CallType>,
    /// Current state
    pub state: CallState,
    /// Failure reason when `Failed`
    pub failure_reason: Option<FailureReason>,
    /// End reason when `Ended`
    pub end_reason: Option<EndReason>,
    /// Latest quality classification
    pub quality: Option<QualityClass>,
    /// Seconds spent connected
    pub duration_seconds: u64,
    /// Local track flags
    pub media: Option<MediaFlags>,
}

impl SessionSnapshot {
    /// Snapshot of a surface with no session yet
    #[must_use]
    pub fn idle() -> Self {
        Self {
            call_id: None,
            peer: None,
            call_type: None,
            state: CallState::Idle,
            failure_reason: None,
            end_reason: None,
            quality: None,
            duration_seconds: 0,
            media: None,
        }
    }
}

/// Liveness of the resources owned by the active session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionDiagnostics {
    /// Quality sampling task alive
    pub quality_task_active: bool,
    /// Cancelled flag of the session's quality task, `None` if it never started
    pub quality_task_cancelled: Option<bool>,
    /// Duration timer alive
    pub duration_timer_active: bool,
    /// Device acquisition in flight
    pub acquisition_pending: bool,
    /// Peer link present and not closed
    pub link_open: bool,
    /// Media handle held and not released
    pub media_held: bool,
    /// Times the cleanup routine actually ran, across all sessions of this surface
    pub cleanup_runs: u64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id() {
        let id1 = CallId::new();
        let id2 = CallId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_required_kinds() {
        assert_eq!(CallType::Voice.required_kinds(), MediaKinds::AUDIO);
        assert_eq!(CallType::Video.required_kinds(), MediaKinds::AUDIO_VIDEO);
        let kinds: Vec<_> = MediaKinds::AUDIO_VIDEO.iter().collect();
        assert_eq!(kinds, vec![MediaKind::Audio, MediaKind::Video]);
        assert_eq!(MediaKinds::AUDIO.iter().count(), 1);
    }

    #[test]
    fn test_happy_path_edges() {
        let path = [
            CallState::Idle,
            CallState::Initializing,
            CallState::Connecting,
            CallState::Ringing,
            CallState::Connected,
            CallState::Ended,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
    }

    #[test]
    fn test_terminal_states_have_no_edges() {
        let all = [
            CallState::Idle,
            CallState::Initializing,
            CallState::Connecting,
            CallState::Ringing,
            CallState::Connected,
            CallState::Ended,
            CallState::Failed,
        ];
        for to in all {
            assert!(!CallState::Ended.can_transition_to(to));
            assert!(!CallState::Failed.can_transition_to(to));
        }
        assert!(!CallState::Connected.can_transition_to(CallState::Failed));
        assert!(!CallState::Idle.can_transition_to(CallState::Connected));
    }

    #[test]
    fn test_link_stats_constructors() {
        let healthy = LinkStats::healthy(Duration::from_millis(40));
        assert!(healthy.connected);
        assert_eq!(healthy.packet_loss, 0.0);
        assert!(!LinkStats::lost().connected);
    }

    #[test]
    fn test_snapshot_serialization() {
        let snapshot = SessionSnapshot::idle();
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: SessionSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }
}
