//! Saorsa Call - one-to-one voice and video call sessions
//!
//! This library owns the lifecycle of a single call from the caller's side:
//!
//! - **Session state machine**: `Idle → Initializing → Connecting → Ringing →
//!   Connected → Ended`, with `Failed` reachable from every setup state
//! - **Media resources**: microphone/camera acquisition with guaranteed release
//! - **Peer negotiation**: ICE/STUN through the webrtc crate, or an in-process
//!   loopback peer for tests and demos
//! - **Quality monitoring**: periodic link sampling through a pluggable policy
//! - **Control surface**: mute, video, end and retry commands serialized
//!   through one controller task per call screen
//!
//! Every path out of a session (hang-up, remote hang-up, failure, retry,
//! dispose) runs the same cleanup exactly once.
//!
//! # Examples
//!
//! ```rust,no_run
//! use saorsa_call_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let service = CallService::builder(Arc::new(LoopbackNegotiator::new(LoopbackScript::answering())))
//!     .with_capture_backend(Arc::new(VirtualCaptureBackend::new()))
//!     .build()?;
//!
//! let surface = service
//!     .initiate_call(PeerContact::new("eve-frank-grace-henry"), CallType::Video)
//!     .await?;
//! surface.wait_until(|s| s.state == CallState::Connected).await?;
//! surface.mute().await?;
//! surface.end().await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and data structures
pub mod types;

/// Peer contact records
pub mod contact;

/// Local capture device management
pub mod media;

/// Owned background tasks
pub mod task;

/// Call signaling protocol and handlers
pub mod signaling;

/// Peer link negotiation abstraction
pub mod negotiator;

/// In-process simulated remote peer
pub mod loopback;

/// ICE/STUN negotiation through the webrtc crate (requires webrtc-transport feature)
#[cfg(feature = "webrtc-transport")]
pub mod webrtc_link;

/// Connection quality monitoring
pub mod quality;

/// Call lifecycle analytics
pub mod analytics;

/// Call session controller and configuration
pub mod call;

/// Caller-facing call controls
pub mod control;

/// Call service orchestration
pub mod service;

// Re-export main types at crate root
pub use analytics::{
    AnalyticsError, AnalyticsEvent, AnalyticsSink, RecordingAnalytics, TracingAnalytics,
};
pub use call::{CallConfig, CallError};
pub use contact::{PeerContact, PeerId};
pub use control::ControlSurface;
pub use loopback::{LoopbackLink, LoopbackNegotiator, LoopbackOutcome, LoopbackScript};
pub use media::{
    CaptureBackend, CaptureDevice, MediaError, MediaHandle, MediaResourceManager, Permission,
    VirtualCaptureBackend, VirtualDeviceState,
};
pub use negotiator::{
    IceServerConfig, LinkEvent, LinkState, Negotiation, NegotiationError, NegotiatorConfig,
    PeerLink, PeerNegotiator, RemoteMediaHandle, RemoteTrack,
};
pub use quality::{QualityMonitor, QualityPolicy, ThresholdPolicy, DEFAULT_SAMPLE_INTERVAL};
pub use service::{CallService, CallServiceBuilder, ServiceError};
pub use signaling::{
    MemorySignaling, SignalingError, SignalingHandler, SignalingMessage, SignalingTransport,
};
pub use task::{CancelFlag, TaskGuard};
pub use types::*;
#[cfg(feature = "webrtc-transport")]
pub use webrtc_link::{WebRtcLink, WebRtcNegotiator};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::analytics::{AnalyticsSink, TracingAnalytics};
    pub use crate::call::{CallConfig, CallError};
    pub use crate::contact::{PeerContact, PeerId};
    pub use crate::control::ControlSurface;
    pub use crate::loopback::{LoopbackNegotiator, LoopbackScript};
    pub use crate::media::{CaptureBackend, MediaResourceManager, VirtualCaptureBackend};
    pub use crate::negotiator::{NegotiatorConfig, PeerNegotiator};
    pub use crate::quality::{QualityPolicy, ThresholdPolicy};
    pub use crate::service::{CallService, CallServiceBuilder};
    pub use crate::signaling::{SignalingHandler, SignalingTransport};
    pub use crate::types::{
        CallId, CallState, CallType, CommandOutcome, EndReason, FailureReason, QualityClass,
        SessionSnapshot,
    };
    #[cfg(feature = "webrtc-transport")]
    pub use crate::webrtc_link::WebRtcNegotiator;
}
