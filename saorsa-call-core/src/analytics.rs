//! Fire-and-forget call analytics
//!
//! The controller reports lifecycle events to an [`AnalyticsSink`]. Sinks
//! must not block; an error from a sink is logged and otherwise ignored, it
//! never changes the course of a call.

use crate::types::{CallId, CallType, EndReason, FailureReason, QualityClass};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Analytics errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalyticsError {
    /// Sink refused or failed to store the event
    #[error("Analytics sink unavailable: {0}")]
    Unavailable(String),
}

/// Call lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AnalyticsEvent {
    /// A session was created
    CallInitiated {
        /// Call identifier
        call_id: CallId,
        /// Remote identity
        peer: String,
        /// Voice or video
        call_type: CallType,
    },
    /// Session reached `Connected`
    CallConnected {
        /// Call identifier
        call_id: CallId,
    },
    /// Session entered `Failed`
    CallFailed {
        /// Call identifier
        call_id: CallId,
        /// Why
        reason: FailureReason,
    },
    /// Session entered `Ended`
    CallEnded {
        /// Call identifier
        call_id: CallId,
        /// Why
        reason: EndReason,
        /// Seconds spent connected
        duration_seconds: u64,
    },
    /// Caller retried a failed session
    CallRetried {
        /// The failed session being replaced
        previous: CallId,
    },
    /// Quality classification changed while connected
    QualityChanged {
        /// Call identifier
        call_id: CallId,
        /// New classification
        quality: QualityClass,
    },
}

impl AnalyticsEvent {
    /// Event name as reported to analytics backends
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CallInitiated { .. } => "call_initiated",
            Self::CallConnected { .. } => "call_connected",
            Self::CallFailed { .. } => "call_failed",
            Self::CallEnded { .. } => "call_ended",
            Self::CallRetried { .. } => "call_retried",
            Self::QualityChanged { .. } => "quality_changed",
        }
    }
}

/// Receiver of analytics events
pub trait AnalyticsSink: Send + Sync {
    /// Record an event; must return promptly
    ///
    /// # Errors
    ///
    /// Returns error if the event could not be recorded
    fn record(&self, event: AnalyticsEvent) -> Result<(), AnalyticsError>;
}

/// Sink that writes events to the `saorsa_call::analytics` tracing target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAnalytics;

impl AnalyticsSink for TracingAnalytics {
    fn record(&self, event: AnalyticsEvent) -> Result<(), AnalyticsError> {
        tracing::info!(target: "saorsa_call::analytics", event = event.name(), details = ?event);
        Ok(())
    }
}

/// Sink that keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingAnalytics {
    events: Mutex<Vec<AnalyticsEvent>>,
    failing: AtomicBool,
}

impl RecordingAnalytics {
    /// Empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep recording but report every call as failed
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// All events so far
    #[must_use]
    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.events.lock().clone()
    }

    /// Number of events with this name
    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }
}

impl AnalyticsSink for RecordingAnalytics {
    fn record(&self, event: AnalyticsEvent) -> Result<(), AnalyticsError> {
        self.events.lock().push(event);
        if self.failing.load(Ordering::Acquire) {
            return Err(AnalyticsError::Unavailable("recorder set to fail".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_match_wire_tags() {
        let event = AnalyticsEvent::CallConnected {
            call_id: CallId::new(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"call_connected\""));
        assert_eq!(event.name(), "call_connected");
    }

    #[test]
    fn test_recorder_counts_and_fails() {
        let recorder = RecordingAnalytics::new();
        let id = CallId::new();
        assert!(recorder
            .record(AnalyticsEvent::CallConnected { call_id: id })
            .is_ok());

        recorder.set_failing(true);
        assert!(recorder
            .record(AnalyticsEvent::CallEnded {
                call_id: id,
                reason: EndReason::LocalHangup,
                duration_seconds: 3,
            })
            .is_err());

        assert_eq!(recorder.count("call_connected"), 1);
        assert_eq!(recorder.count("call_ended"), 1);
        assert_eq!(recorder.events().len(), 2);
    }
}
