//! Call service orchestration

use crate::analytics::{AnalyticsSink, TracingAnalytics};
use crate::call::{CallConfig, CallDeps, CallError};
use crate::contact::PeerContact;
use crate::control::ControlSurface;
use crate::media::{CaptureBackend, MediaResourceManager};
use crate::negotiator::PeerNegotiator;
use crate::quality::{QualityPolicy, ThresholdPolicy};
use crate::types::CallType;
use std::sync::Arc;
use thiserror::Error;

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Initialization error
    #[error("Initialization error: {0}")]
    InitError(String),

    /// Call error
    #[error("Call error: {0}")]
    CallError(#[from] CallError),
}

/// Entry point that wires capture, negotiation, quality and analytics into
/// control surfaces
///
/// Each surface gets its own controller task; surfaces created by the same
/// service share the collaborators.
#[derive(Clone)]
pub struct CallService {
    deps: CallDeps,
}

impl CallService {
    /// Create a builder around the negotiator every call will use
    #[must_use]
    pub fn builder(negotiator: Arc<dyn PeerNegotiator>) -> CallServiceBuilder {
        CallServiceBuilder::new(negotiator)
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &CallConfig {
        &self.deps.config
    }

    /// New control surface with no session yet
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn control_surface(&self) -> ControlSurface {
        ControlSurface::spawn(self.deps.clone())
    }

    /// Create a surface and immediately start a call on it
    ///
    /// # Errors
    ///
    /// Returns error if the controller rejects the start
    #[tracing::instrument(skip(self, peer), fields(peer = %peer.identity))]
    pub async fn initiate_call(
        &self,
        peer: PeerContact,
        call_type: CallType,
    ) -> Result<ControlSurface, ServiceError> {
        let surface = self.control_surface();
        let call_id = surface.start(peer, call_type).await?;
        tracing::info!(call_id = %call_id, "Call initiated");
        Ok(surface)
    }
}

/// Call service builder
pub struct CallServiceBuilder {
    negotiator: Arc<dyn PeerNegotiator>,
    capture: Option<Arc<dyn CaptureBackend>>,
    policy: Arc<dyn QualityPolicy>,
    analytics: Arc<dyn AnalyticsSink>,
    config: CallConfig,
}

impl CallServiceBuilder {
    /// Create new builder
    #[must_use]
    pub fn new(negotiator: Arc<dyn PeerNegotiator>) -> Self {
        Self {
            negotiator,
            capture: None,
            policy: Arc::new(ThresholdPolicy::default()),
            analytics: Arc::new(TracingAnalytics),
            config: CallConfig::default(),
        }
    }

    /// Source of microphone and camera devices (required)
    #[must_use]
    pub fn with_capture_backend(mut self, capture: Arc<dyn CaptureBackend>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Replace the default threshold quality policy
    #[must_use]
    pub fn with_quality_policy(mut self, policy: Arc<dyn QualityPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the default tracing analytics sink
    #[must_use]
    pub fn with_analytics(mut self, analytics: Arc<dyn AnalyticsSink>) -> Self {
        self.analytics = analytics;
        self
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the service
    ///
    /// # Errors
    ///
    /// Returns error if no capture backend was configured or the
    /// configuration is unusable
    pub fn build(self) -> Result<CallService, ServiceError> {
        let capture = self
            .capture
            .ok_or_else(|| ServiceError::InitError("no capture backend configured".to_string()))?;
        if self.config.command_capacity == 0 {
            return Err(ServiceError::InitError(
                "command capacity must be non-zero".to_string(),
            ));
        }

        tracing::debug!(config = ?self.config, "Call service built");
        Ok(CallService {
            deps: CallDeps {
                media: MediaResourceManager::new(capture),
                negotiator: self.negotiator,
                policy: self.policy,
                analytics: self.analytics,
                config: self.config,
            },
        })
    }
}
