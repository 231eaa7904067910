//! Call session controller
//!
//! One [`CallSessionController`] task owns the active [`CallSession`] of a
//! control surface and everything attached to it: the media acquisition in
//! flight, the local [`MediaHandle`], the peer link and its event stream, the
//! quality monitor, the duration timer and the connect deadline. Commands and
//! resource events are handled one at a time in a single `select!` loop, so
//! every state change is serialized without locks.
//!
//! # Lifecycle
//!
//! ```text
//!  start ─► Initializing ──media──► Connecting ──ringing──► Ringing ──answer──► Connected
//!               │                        │                     │                    │
//!               └── error / end ─────────┴─────────────────────┴──► Failed / Ended ◄┘
//! ```
//!
//! Entering `Ended` or `Failed` runs the session cleanup exactly once. The
//! same cleanup runs on retry, on dispose and when the last control surface
//! is dropped; a second invocation is a no-op.

use crate::analytics::{AnalyticsEvent, AnalyticsSink};
use crate::contact::PeerContact;
use crate::media::{MediaError, MediaHandle, MediaResourceManager};
use crate::negotiator::{LinkEvent, PeerLink, PeerNegotiator, RemoteMediaHandle};
use crate::quality::{QualityMonitor, QualityPolicy, DEFAULT_SAMPLE_INTERVAL};
use crate::task::{CancelFlag, TaskGuard};
use crate::types::{
    CallId, CallSession, CallState, CallType, CommandOutcome, EndReason, FailureReason, MediaKind,
    QualitySample, SessionDiagnostics, SessionSnapshot,
};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::pending;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};

/// Call control errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// A non-terminal session already exists on this surface
    #[error("A call is already in progress (state {0:?})")]
    SessionActive(CallState),

    /// No session has been started yet
    #[error("No call session")]
    NoSession,

    /// Requested transition is not an edge of the state machine
    #[error("Invalid call state transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// Current state
        from: CallState,
        /// Requested state
        to: CallState,
    },

    /// Video command on a voice call
    #[error("Call has no video track")]
    NotVideoCall,

    /// Media operation failed
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// Controller task has shut down
    #[error("Call controller closed")]
    ControllerClosed,
}

/// Call controller configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Seconds between quality samples
    pub quality_interval_secs: u64,
    /// Seconds a session may spend in `Connecting`/`Ringing`; `None` waits forever
    pub connect_timeout_secs: Option<u64>,
    /// Queued commands per surface
    pub command_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            quality_interval_secs: DEFAULT_SAMPLE_INTERVAL.as_secs(),
            connect_timeout_secs: Some(30),
            command_capacity: 32,
        }
    }
}

impl CallConfig {
    /// Quality sampling interval, at least one second
    #[must_use]
    pub fn quality_interval(&self) -> Duration {
        Duration::from_secs(self.quality_interval_secs.max(1))
    }

    /// Connect deadline measured from entering `Connecting`
    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }
}

/// Collaborators shared by every controller a service spawns
#[derive(Clone)]
pub(crate) struct CallDeps {
    pub(crate) media: MediaResourceManager,
    pub(crate) negotiator: Arc<dyn PeerNegotiator>,
    pub(crate) policy: Arc<dyn QualityPolicy>,
    pub(crate) analytics: Arc<dyn AnalyticsSink>,
    pub(crate) config: CallConfig,
}

/// Request sent from a control surface to its controller
pub(crate) enum Command {
    Start {
        peer: PeerContact,
        call_type: CallType,
        reply: oneshot::Sender<Result<CallId, CallError>>,
    },
    Retry {
        reply: oneshot::Sender<Result<CallId, CallError>>,
    },
    End {
        reply: oneshot::Sender<Result<CommandOutcome, CallError>>,
    },
    /// `enabled: None` toggles
    SetTrack {
        kind: MediaKind,
        enabled: Option<bool>,
        reply: oneshot::Sender<Result<CommandOutcome, CallError>>,
    },
    Diagnostics {
        reply: oneshot::Sender<SessionDiagnostics>,
    },
    Dispose {
        reply: oneshot::Sender<()>,
    },
}

/// Ordered fan-out of session changes
///
/// Every subscriber owns an unbounded queue, so a reader that falls behind
/// still sees each state, quality and track change in order. The per-second
/// duration refresh only goes to the `watch` channel, which keeps a queue's
/// length proportional to the number of changes rather than to call length.
pub(crate) struct SnapshotFeed {
    // None once the controller has stopped
    subscribers: Mutex<Option<Vec<mpsc::UnboundedSender<SessionSnapshot>>>>,
}

impl SnapshotFeed {
    fn new() -> Self {
        Self {
            subscribers: Mutex::new(Some(Vec::new())),
        }
    }

    /// Queue of every change published from now on
    ///
    /// After the controller stops the queue is returned already closed.
    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionSnapshot> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(subscribers) = self.subscribers.lock().as_mut() {
            subscribers.push(tx);
        }
        rx
    }

    fn publish(&self, snapshot: &SessionSnapshot) {
        if let Some(subscribers) = self.subscribers.lock().as_mut() {
            subscribers.retain(|tx| tx.send(snapshot.clone()).is_ok());
        }
    }

    fn close(&self) {
        self.subscribers.lock().take();
    }
}

/// Channels a control surface keeps to talk to its controller
pub(crate) struct ControllerChannels {
    pub(crate) commands: mpsc::Sender<Command>,
    pub(crate) updates: Arc<SnapshotFeed>,
    pub(crate) current: watch::Receiver<SessionSnapshot>,
    pub(crate) task: JoinHandle<()>,
}

enum Termination {
    Failed(FailureReason),
    Ended(EndReason),
}

impl Termination {
    fn state(&self) -> CallState {
        match self {
            Self::Failed(_) => CallState::Failed,
            Self::Ended(_) => CallState::Ended,
        }
    }
}

/// Something one of the session's resources produced
enum SessionEvent {
    MediaAcquired(Result<MediaHandle, MediaError>),
    AcquisitionLost,
    Link(Option<LinkEvent>),
    Quality(Option<QualitySample>),
    Tick,
    TimerStopped,
    ConnectTimeout,
}

struct Acquisition {
    _task: TaskGuard,
    result: oneshot::Receiver<Result<MediaHandle, MediaError>>,
}

/// Everything a session owns that must be torn down with it
#[derive(Default)]
struct SessionResources {
    acquisition: Option<Acquisition>,
    media: Option<MediaHandle>,
    link: Option<Arc<dyn PeerLink>>,
    link_events: Option<mpsc::Receiver<LinkEvent>>,
    quality: Option<QualityMonitor>,
    quality_samples: Option<mpsc::Receiver<QualitySample>>,
    quality_flag: Option<CancelFlag>,
    duration_timer: Option<TaskGuard>,
    ticks: Option<mpsc::Receiver<()>>,
    connected_since: Option<Instant>,
    connect_deadline: Option<Pin<Box<Sleep>>>,
    cleaned_up: bool,
}

impl Drop for SessionResources {
    fn drop(&mut self) {
        if self.cleaned_up {
            return;
        }
        // task guards and the media handle release themselves; the link needs an async close
        tracing::warn!("Session resources dropped without cleanup");
        if let Some(link) = self.link.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move { link.close().await });
            }
        }
    }
}

struct ActiveSession {
    session: CallSession,
    resources: SessionResources,
}

/// Single-owner state machine for the sessions of one control surface
pub(crate) struct CallSessionController {
    deps: CallDeps,
    commands: mpsc::Receiver<Command>,
    updates: Arc<SnapshotFeed>,
    current: watch::Sender<SessionSnapshot>,
    active: Option<ActiveSession>,
    cleanup_runs: u64,
}

impl CallSessionController {
    /// Spawn a controller task on the current runtime
    pub(crate) fn spawn(deps: CallDeps) -> ControllerChannels {
        let (commands_tx, commands_rx) = mpsc::channel(deps.config.command_capacity.max(1));
        let updates = Arc::new(SnapshotFeed::new());
        let (current_tx, current_rx) = watch::channel(SessionSnapshot::idle());

        let controller = Self {
            deps,
            commands: commands_rx,
            updates: Arc::clone(&updates),
            current: current_tx,
            active: None,
            cleanup_runs: 0,
        };
        let task = tokio::spawn(controller.run());

        ControllerChannels {
            commands: commands_tx,
            updates,
            current: current_rx,
            task,
        }
    }

    async fn run(mut self) {
        tracing::debug!("Call session controller started");
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        tracing::debug!("All control surfaces dropped");
                        self.shutdown().await;
                        break;
                    };
                    if self.handle_command(command).await.is_break() {
                        break;
                    }
                }
                event = next_event(self.active.as_mut().map(|a| &mut a.resources)) => {
                    self.handle_event(event).await;
                }
            }
        }
        tracing::debug!(
            cleanup_runs = self.cleanup_runs,
            "Call session controller stopped"
        );
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Start {
                peer,
                call_type,
                reply,
            } => {
                let result = self.start(peer, call_type).await;
                let _ = reply.send(result);
            }
            Command::Retry { reply } => {
                let result = self.retry().await;
                let _ = reply.send(result);
            }
            Command::End { reply } => {
                let result = self.end().await;
                let _ = reply.send(result);
            }
            Command::SetTrack {
                kind,
                enabled,
                reply,
            } => {
                let result = self.set_track(kind, enabled);
                let _ = reply.send(result);
            }
            Command::Diagnostics { reply } => {
                let _ = reply.send(self.diagnostics());
            }
            Command::Dispose { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::MediaAcquired(result) => {
                if let Some(resources) = self.resources_mut() {
                    resources.acquisition = None;
                }
                self.on_media(result).await;
            }
            SessionEvent::AcquisitionLost => {
                if let Some(resources) = self.resources_mut() {
                    resources.acquisition = None;
                }
                tracing::error!("Media acquisition task ended without a result");
                self.terminate(Termination::Failed(FailureReason::DeviceNotFound))
                    .await;
            }
            SessionEvent::Link(event) => self.on_link_event(event).await,
            SessionEvent::Quality(Some(sample)) => self.on_quality(&sample),
            SessionEvent::Quality(None) => {
                if let Some(resources) = self.resources_mut() {
                    resources.quality_samples = None;
                }
            }
            SessionEvent::Tick => self.on_tick(),
            SessionEvent::TimerStopped => {
                if let Some(resources) = self.resources_mut() {
                    resources.ticks = None;
                }
            }
            SessionEvent::ConnectTimeout => {
                if let Some(resources) = self.resources_mut() {
                    resources.connect_deadline = None;
                }
                if self.state().is_some_and(CallState::is_setup) {
                    tracing::warn!("Peer did not connect before the deadline");
                    self.terminate(Termination::Failed(FailureReason::SignalingTimeout))
                        .await;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    #[tracing::instrument(skip(self, peer), fields(peer = %peer.identity))]
    async fn start(&mut self, peer: PeerContact, call_type: CallType) -> Result<CallId, CallError> {
        if let Some(state) = self.state() {
            if !state.is_terminal() {
                return Err(CallError::SessionActive(state));
            }
        }
        self.cleanup().await;

        let session = CallSession::new(peer, call_type);
        let call_id = session.id;
        tracing::info!(call_id = %call_id, "Starting call");
        self.record(AnalyticsEvent::CallInitiated {
            call_id,
            peer: session.peer.identity.to_string(),
            call_type,
        });
        self.active = Some(ActiveSession {
            session,
            resources: SessionResources::default(),
        });
        self.publish();

        self.set_state(CallState::Initializing)?;

        let media = self.deps.media.clone();
        let (tx, rx) = oneshot::channel();
        let task = TaskGuard::spawn("media-acquisition", async move {
            let result = media.acquire(call_type).await;
            // a dropped receiver means the session is gone; the handle releases on drop
            let _ = tx.send(result);
        });
        if let Some(resources) = self.resources_mut() {
            resources.acquisition = Some(Acquisition {
                _task: task,
                result: rx,
            });
        }
        self.publish();
        Ok(call_id)
    }

    async fn retry(&mut self) -> Result<CallId, CallError> {
        let active = self.active.as_ref().ok_or(CallError::NoSession)?;
        let state = active.session.state;
        if state != CallState::Failed {
            return Err(CallError::InvalidTransition {
                from: state,
                to: CallState::Initializing,
            });
        }
        let previous = active.session.id;
        let peer = active.session.peer.clone();
        let call_type = active.session.call_type;

        tracing::info!(previous_call_id = %previous, "Retrying failed call");
        self.record(AnalyticsEvent::CallRetried { previous });
        self.start(peer, call_type).await
    }

    async fn end(&mut self) -> Result<CommandOutcome, CallError> {
        let state = self.state().ok_or(CallError::NoSession)?;
        if state.is_terminal() {
            return Ok(CommandOutcome::AlreadyEnded);
        }
        let reason = if state == CallState::Connected {
            EndReason::LocalHangup
        } else {
            EndReason::UserCancelled
        };
        self.terminate(Termination::Ended(reason)).await;
        Ok(CommandOutcome::Done)
    }

    fn set_track(
        &mut self,
        kind: MediaKind,
        enabled: Option<bool>,
    ) -> Result<CommandOutcome, CallError> {
        let active = self.active.as_mut().ok_or(CallError::NoSession)?;
        if kind == MediaKind::Video && !active.session.call_type.has_video() {
            return Err(CallError::NotVideoCall);
        }
        if active.session.state != CallState::Connected {
            return Ok(CommandOutcome::NotConnected);
        }
        let Some(handle) = active.resources.media.as_mut() else {
            return Ok(CommandOutcome::NotConnected);
        };

        let target = enabled.unwrap_or_else(|| !handle.is_enabled(kind).unwrap_or(false));
        let now = self.deps.media.set_track_enabled(handle, kind, target)?;
        active.session.media = Some(handle.flags());
        tracing::info!(
            call_id = %active.session.id,
            kind = %kind,
            enabled = now,
            "Local track toggled"
        );
        self.publish();
        Ok(CommandOutcome::Track { kind, enabled: now })
    }

    async fn shutdown(&mut self) {
        if self.state().is_some_and(|s| !s.is_terminal()) {
            self.terminate(Termination::Ended(EndReason::Disposed)).await;
        }
        self.cleanup().await;
    }

    fn diagnostics(&self) -> SessionDiagnostics {
        let Some(active) = &self.active else {
            return SessionDiagnostics {
                cleanup_runs: self.cleanup_runs,
                ..SessionDiagnostics::default()
            };
        };
        let res = &active.resources;
        SessionDiagnostics {
            quality_task_active: res.quality.as_ref().is_some_and(QualityMonitor::is_running),
            quality_task_cancelled: res.quality_flag.as_ref().map(CancelFlag::is_cancelled),
            duration_timer_active: res.duration_timer.as_ref().is_some_and(TaskGuard::is_active),
            acquisition_pending: res.acquisition.is_some(),
            link_open: res.link.as_ref().is_some_and(|l| !l.is_closed()),
            media_held: res.media.as_ref().is_some_and(|m| !m.is_released()),
            cleanup_runs: self.cleanup_runs,
        }
    }

    // ------------------------------------------------------------------
    // Resource events
    // ------------------------------------------------------------------

    async fn on_media(&mut self, result: Result<MediaHandle, MediaError>) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.session.state != CallState::Initializing {
            return;
        }
        let handle = match result {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(call_id = %active.session.id, error = %e, "Media acquisition failed");
                let reason = e
                    .failure_reason()
                    .unwrap_or(FailureReason::DeviceNotFound);
                self.terminate(Termination::Failed(reason)).await;
                return;
            }
        };

        let call_id = active.session.id;
        let peer = active.session.peer.clone();
        active.session.media = Some(handle.flags());
        active.resources.media = Some(handle);

        if self.set_state(CallState::Connecting).is_err() {
            return;
        }
        let timeout = self.deps.config.connect_timeout();
        if let (Some(timeout), Some(resources)) = (timeout, self.resources_mut()) {
            resources.connect_deadline = Some(Box::pin(tokio::time::sleep(timeout)));
        }
        self.publish();

        let negotiator = Arc::clone(&self.deps.negotiator);
        let negotiation = {
            let Some(media) = self
                .active
                .as_ref()
                .and_then(|a| a.resources.media.as_ref())
            else {
                return;
            };
            negotiator.connect(call_id, &peer, media).await
        };

        match negotiation {
            Ok(negotiation) => {
                tracing::debug!(call_id = %call_id, "Negotiation started");
                if let Some(resources) = self.resources_mut() {
                    resources.link = Some(negotiation.link);
                    resources.link_events = Some(negotiation.events);
                }
            }
            Err(e) => {
                tracing::warn!(call_id = %call_id, error = %e, "Could not start negotiation");
                self.terminate(Termination::Failed(FailureReason::NegotiationFailed(
                    e.to_string(),
                )))
                .await;
            }
        }
    }

    async fn on_link_event(&mut self, event: Option<LinkEvent>) {
        let Some(state) = self.state() else {
            return;
        };
        let Some(event) = event else {
            if let Some(resources) = self.resources_mut() {
                resources.link_events = None;
            }
            if state.is_setup() {
                self.terminate(Termination::Failed(FailureReason::NegotiationFailed(
                    "negotiation ended without connecting".to_string(),
                )))
                .await;
            }
            return;
        };
        tracing::trace!(state = ?state, event = ?event, "Link event");

        match event {
            LinkEvent::Connecting => {}
            LinkEvent::Ringing => {
                if state == CallState::Connecting && self.set_state(CallState::Ringing).is_ok() {
                    self.publish();
                }
            }
            LinkEvent::Connected { remote } => {
                // remotes that answer instantly never report ringing
                if state == CallState::Connecting && self.set_state(CallState::Ringing).is_ok() {
                    self.publish();
                }
                if self.state() == Some(CallState::Ringing) {
                    self.enter_connected(&remote);
                }
            }
            LinkEvent::RemoteHangup { reason } => {
                let detail = reason.unwrap_or_else(|| "remote declined".to_string());
                self.on_link_lost(state, detail, EndReason::RemoteHangup)
                    .await;
            }
            LinkEvent::Failed(detail) => {
                self.on_link_lost(state, detail, EndReason::LinkLost).await;
            }
            LinkEvent::Disconnected => {
                self.on_link_lost(state, "link disconnected".to_string(), EndReason::LinkLost)
                    .await;
            }
            LinkEvent::Closed => {
                self.on_link_lost(state, "link closed".to_string(), EndReason::LinkLost)
                    .await;
            }
        }
    }

    async fn on_link_lost(&mut self, state: CallState, detail: String, connected: EndReason) {
        if state.is_setup() {
            self.terminate(Termination::Failed(FailureReason::NegotiationFailed(detail)))
                .await;
        } else if state == CallState::Connected {
            tracing::info!(detail = %detail, "Peer link ended");
            self.terminate(Termination::Ended(connected)).await;
        }
    }

    fn enter_connected(&mut self, remote: &RemoteMediaHandle) {
        if self.set_state(CallState::Connected).is_err() {
            return;
        }
        let interval = self.deps.config.quality_interval();
        let policy = Arc::clone(&self.deps.policy);
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let call_id = active.session.id;
        active.session.connected_at = Some(Utc::now());

        let res = &mut active.resources;
        res.connect_deadline = None;
        res.connected_since = Some(Instant::now());
        let (timer, ticks) = spawn_duration_timer();
        res.duration_timer = Some(timer);
        res.ticks = Some(ticks);
        if let Some(link) = res.link.clone() {
            let (monitor, samples) = QualityMonitor::start(link, interval, policy);
            res.quality_flag = Some(monitor.cancel_flag());
            res.quality = Some(monitor);
            res.quality_samples = Some(samples);
        }

        tracing::info!(
            call_id = %call_id,
            remote_tracks = remote.tracks.len(),
            "Call connected"
        );
        self.record(AnalyticsEvent::CallConnected { call_id });
        self.publish();
    }

    fn on_quality(&mut self, sample: &QualitySample) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.session.state != CallState::Connected
            || active.session.quality == Some(sample.classification)
        {
            return;
        }
        active.session.quality = Some(sample.classification);
        let call_id = active.session.id;
        tracing::info!(
            call_id = %call_id,
            quality = %sample.classification,
            packet_loss = sample.stats.as_ref().map(|s| s.packet_loss),
            "Call quality changed"
        );
        self.record(AnalyticsEvent::QualityChanged {
            call_id,
            quality: sample.classification,
        });
        self.publish();
    }

    fn on_tick(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.session.state != CallState::Connected {
            return;
        }
        let Some(since) = active.resources.connected_since else {
            return;
        };
        let elapsed = since.elapsed().as_secs();
        if elapsed != active.session.duration_seconds {
            active.session.duration_seconds = elapsed;
            self.current.send_replace(self.snapshot());
        }
    }

    // ------------------------------------------------------------------
    // State and teardown
    // ------------------------------------------------------------------

    fn set_state(&mut self, to: CallState) -> Result<(), CallError> {
        let active = self.active.as_mut().ok_or(CallError::NoSession)?;
        let from = active.session.state;
        if !from.can_transition_to(to) {
            tracing::warn!(
                call_id = %active.session.id,
                current_state = ?from,
                requested_state = ?to,
                "Rejected call state transition"
            );
            return Err(CallError::InvalidTransition { from, to });
        }
        active.session.state = to;
        tracing::debug!(
            call_id = %active.session.id,
            old_state = ?from,
            new_state = ?to,
            "Call state transition"
        );
        Ok(())
    }

    /// Move into `Ended`/`Failed` and tear the session down
    ///
    /// Ignored when the session is already terminal, which makes racing
    /// end/failure signals settle on whichever arrived first.
    async fn terminate(&mut self, termination: Termination) {
        let target = termination.state();
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let from = active.session.state;
        if !from.can_transition_to(target) {
            tracing::debug!(
                call_id = %active.session.id,
                current_state = ?from,
                requested_state = ?target,
                "Session already settled"
            );
            return;
        }

        active.session.state = target;
        active.session.ended_at = Some(Utc::now());
        if from == CallState::Connected {
            if let Some(since) = active.resources.connected_since {
                active.session.duration_seconds = since.elapsed().as_secs();
            }
        }
        let call_id = active.session.id;
        let event = match termination {
            Termination::Failed(reason) => {
                tracing::warn!(
                    call_id = %call_id,
                    old_state = ?from,
                    reason = %reason,
                    "Call failed"
                );
                active.session.failure_reason = Some(reason.clone());
                AnalyticsEvent::CallFailed { call_id, reason }
            }
            Termination::Ended(reason) => {
                let duration_seconds = active.session.duration_seconds;
                tracing::info!(
                    call_id = %call_id,
                    old_state = ?from,
                    reason = ?reason,
                    duration_seconds,
                    "Call ended"
                );
                active.session.end_reason = Some(reason);
                AnalyticsEvent::CallEnded {
                    call_id,
                    reason,
                    duration_seconds,
                }
            }
        };

        self.cleanup().await;
        self.record(event);
        self.publish();
    }

    /// Release everything the session holds; runs at most once per session
    async fn cleanup(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let res = &mut active.resources;
        if res.cleaned_up {
            return;
        }
        res.cleaned_up = true;
        self.cleanup_runs += 1;

        if let Some(mut monitor) = res.quality.take() {
            monitor.stop();
        }
        res.quality_samples = None;
        if let Some(mut timer) = res.duration_timer.take() {
            timer.cancel();
        }
        res.ticks = None;
        res.connect_deadline = None;
        // dropping the guard aborts acquisition; a handle it already produced is dropped with it
        res.acquisition = None;
        res.link_events = None;
        if let Some(link) = res.link.take() {
            link.close().await;
        }
        if let Some(mut handle) = res.media.take() {
            self.deps.media.release(&mut handle);
        }
        active.session.media = None;

        tracing::debug!(
            call_id = %active.session.id,
            cleanup_runs = self.cleanup_runs,
            "Session resources released"
        );
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn state(&self) -> Option<CallState> {
        self.active.as_ref().map(|a| a.session.state)
    }

    fn resources_mut(&mut self) -> Option<&mut SessionResources> {
        self.active.as_mut().map(|a| &mut a.resources)
    }

    fn snapshot(&self) -> SessionSnapshot {
        self.active
            .as_ref()
            .map_or_else(SessionSnapshot::idle, |a| a.session.snapshot())
    }

    /// Push a change to the current snapshot and to every subscriber
    fn publish(&self) {
        let snapshot = self.snapshot();
        self.updates.publish(&snapshot);
        self.current.send_replace(snapshot);
    }

    fn record(&self, event: AnalyticsEvent) {
        let name = event.name();
        if let Err(e) = self.deps.analytics.record(event) {
            tracing::warn!(event = name, error = %e, "Analytics sink rejected event");
        }
    }
}

impl Drop for CallSessionController {
    fn drop(&mut self) {
        // ends every subscriber's stream once the last change is queued
        self.updates.close();
    }
}

async fn next_event(resources: Option<&mut SessionResources>) -> SessionEvent {
    let Some(resources) = resources else {
        return pending().await;
    };
    let SessionResources {
        acquisition,
        link_events,
        quality_samples,
        ticks,
        connect_deadline,
        ..
    } = resources;

    tokio::select! {
        result = recv_acquisition(acquisition) => match result {
            Ok(result) => SessionEvent::MediaAcquired(result),
            Err(_) => SessionEvent::AcquisitionLost,
        },
        event = recv_or_pending(link_events) => SessionEvent::Link(event),
        sample = recv_or_pending(quality_samples) => SessionEvent::Quality(sample),
        tick = recv_or_pending(ticks) => match tick {
            Some(()) => SessionEvent::Tick,
            None => SessionEvent::TimerStopped,
        },
        () = wait_deadline(connect_deadline) => SessionEvent::ConnectTimeout,
    }
}

async fn recv_acquisition(
    acquisition: &mut Option<Acquisition>,
) -> Result<Result<MediaHandle, MediaError>, oneshot::error::RecvError> {
    match acquisition {
        Some(acquisition) => (&mut acquisition.result).await,
        None => pending().await,
    }
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn wait_deadline(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

fn spawn_duration_timer() -> (TaskGuard, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(1);
    let task = TaskGuard::spawn("duration-timer", async move {
        let period = Duration::from_secs(1);
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            if tx.send(()).await.is_err() {
                break;
            }
        }
    });
    (task, rx)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::analytics::RecordingAnalytics;
    use crate::media::VirtualCaptureBackend;
    use crate::negotiator::{LinkState, Negotiation, NegotiationError};
    use crate::quality::ThresholdPolicy;
    use crate::types::LinkStats;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Link whose events are pushed by the test
    struct ManualLink {
        closed: AtomicBool,
    }

    #[async_trait]
    impl PeerLink for ManualLink {
        fn negotiation_state(&self) -> LinkState {
            if self.closed.load(Ordering::Acquire) {
                LinkState::Closed
            } else {
                LinkState::Connecting
            }
        }

        fn remote_media(&self) -> Option<RemoteMediaHandle> {
            None
        }

        async fn stats(&self) -> Result<LinkStats, NegotiationError> {
            Ok(LinkStats::healthy(Duration::from_millis(20)))
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }
    }

    #[derive(Default)]
    struct ManualNegotiator {
        events: Mutex<Option<mpsc::Sender<LinkEvent>>>,
        link: Mutex<Option<Arc<ManualLink>>>,
    }

    impl ManualNegotiator {
        async fn send(&self, event: LinkEvent) {
            let tx = self.events.lock().clone().expect("negotiation not started");
            tx.send(event).await.unwrap();
        }

        fn hang_up_stream(&self) {
            self.events.lock().take();
        }
    }

    #[async_trait]
    impl PeerNegotiator for ManualNegotiator {
        async fn connect(
            &self,
            _call_id: CallId,
            _peer: &PeerContact,
            _media: &MediaHandle,
        ) -> Result<Negotiation, NegotiationError> {
            let (tx, rx) = mpsc::channel(8);
            let link = Arc::new(ManualLink {
                closed: AtomicBool::new(false),
            });
            *self.events.lock() = Some(tx);
            *self.link.lock() = Some(Arc::clone(&link));
            Ok(Negotiation { link, events: rx })
        }
    }

    struct Harness {
        channels: ControllerChannels,
        negotiator: Arc<ManualNegotiator>,
        analytics: Arc<RecordingAnalytics>,
        backend: VirtualCaptureBackend,
    }

    impl Harness {
        fn new() -> Self {
            let backend = VirtualCaptureBackend::new();
            let negotiator = Arc::new(ManualNegotiator::default());
            let analytics = Arc::new(RecordingAnalytics::new());
            let deps = CallDeps {
                media: MediaResourceManager::new(Arc::new(backend.clone())),
                negotiator: negotiator.clone(),
                policy: Arc::new(ThresholdPolicy::default()),
                analytics: analytics.clone(),
                config: CallConfig::default(),
            };
            Self {
                channels: CallSessionController::spawn(deps),
                negotiator,
                analytics,
                backend,
            }
        }

        async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> T {
            let (tx, rx) = oneshot::channel();
            self.channels.commands.send(make(tx)).await.unwrap();
            rx.await.unwrap()
        }

        async fn start(&self, call_type: CallType) -> CallId {
            self.request(|reply| Command::Start {
                peer: PeerContact::new("bob"),
                call_type,
                reply,
            })
            .await
            .unwrap()
        }

        async fn wait_for(&self, state: CallState) -> SessionSnapshot {
            let mut current = self.channels.current.clone();
            let snapshot = tokio::time::timeout(
                Duration::from_secs(60),
                current.wait_for(|s| s.state == state),
            )
            .await
            .expect("state not reached")
            .unwrap();
            snapshot.clone()
        }

        async fn diagnostics(&self) -> SessionDiagnostics {
            self.request(|reply| Command::Diagnostics { reply }).await
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = CallConfig::default();
        assert_eq!(config.quality_interval(), Duration::from_secs(5));
        assert_eq!(config.connect_timeout(), Some(Duration::from_secs(30)));

        let config: CallConfig = serde_json::from_str(r#"{"connect_timeout_secs":null}"#).unwrap();
        assert_eq!(config.connect_timeout(), None);
        assert_eq!(config.command_capacity, 32);
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let config = CallConfig {
            quality_interval_secs: 0,
            ..CallConfig::default()
        };
        assert_eq!(config.quality_interval(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_without_ringing_passes_through_ringing() {
        let harness = Harness::new();
        let mut updates = harness.channels.updates.subscribe();
        harness.start(CallType::Voice).await;
        harness.wait_for(CallState::Connecting).await;

        harness
            .negotiator
            .send(LinkEvent::Connected {
                remote: RemoteMediaHandle::default(),
            })
            .await;
        harness.wait_for(CallState::Connected).await;

        let mut states = Vec::new();
        while let Ok(snapshot) = updates.try_recv() {
            if states.last() != Some(&snapshot.state) {
                states.push(snapshot.state);
            }
        }
        assert_eq!(
            states,
            vec![
                CallState::Idle,
                CallState::Initializing,
                CallState::Connecting,
                CallState::Ringing,
                CallState::Connected,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_after_connect_ends_with_link_lost() {
        let harness = Harness::new();
        harness.start(CallType::Voice).await;
        harness.wait_for(CallState::Connecting).await;
        harness.negotiator.send(LinkEvent::Ringing).await;
        harness
            .negotiator
            .send(LinkEvent::Connected {
                remote: RemoteMediaHandle::default(),
            })
            .await;
        harness.wait_for(CallState::Connected).await;

        harness
            .negotiator
            .send(LinkEvent::Failed("ice restart failed".to_string()))
            .await;
        let snapshot = harness.wait_for(CallState::Ended).await;
        assert_eq!(snapshot.end_reason, Some(EndReason::LinkLost));
        assert_eq!(snapshot.failure_reason, None);

        let diagnostics = harness.diagnostics().await;
        assert_eq!(diagnostics.cleanup_runs, 1);
        assert_eq!(diagnostics.quality_task_cancelled, Some(true));
        assert!(!diagnostics.link_open);
        assert!(!harness.backend.any_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_after_terminal_are_ignored() {
        let harness = Harness::new();
        harness.start(CallType::Voice).await;
        harness.wait_for(CallState::Connecting).await;

        harness
            .negotiator
            .send(LinkEvent::RemoteHangup {
                reason: Some("busy".to_string()),
            })
            .await;
        let failed = harness.wait_for(CallState::Failed).await;
        assert_eq!(
            failed.failure_reason,
            Some(FailureReason::NegotiationFailed("busy".to_string()))
        );

        // the receiver was dropped during cleanup, so late events have nowhere to go
        let tx = harness.negotiator.events.lock().clone().unwrap();
        assert!(tx
            .send(LinkEvent::Connected {
                remote: RemoteMediaHandle::default(),
            })
            .await
            .is_err());
        assert_eq!(harness.channels.current.borrow().state, CallState::Failed);
        assert_eq!(harness.analytics.count("call_failed"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_stream_end_during_setup_fails() {
        let harness = Harness::new();
        harness.start(CallType::Voice).await;
        harness.wait_for(CallState::Connecting).await;
        harness.negotiator.hang_up_stream();

        let snapshot = harness.wait_for(CallState::Failed).await;
        assert!(matches!(
            snapshot.failure_reason,
            Some(FailureReason::NegotiationFailed(_))
        ));
        let link = harness.negotiator.link.lock().clone().unwrap();
        assert!(link.closed.load(Ordering::Acquire));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_rejected_while_active() {
        let harness = Harness::new();
        harness.start(CallType::Voice).await;
        let err = harness
            .request(|reply| Command::Start {
                peer: PeerContact::new("carol"),
                call_type: CallType::Voice,
                reply,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::SessionActive(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_channels_disposes_session() {
        let harness = Harness::new();
        harness.start(CallType::Video).await;
        harness.wait_for(CallState::Connecting).await;
        assert!(harness.backend.any_open());

        let Harness {
            channels, backend, ..
        } = harness;
        let ControllerChannels { commands, task, .. } = channels;
        drop(commands);
        task.await.unwrap();

        assert!(!backend.any_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_refresh_stays_off_the_feed() {
        let harness = Harness::new();
        let mut updates = harness.channels.updates.subscribe();
        harness.start(CallType::Voice).await;
        harness.wait_for(CallState::Connecting).await;
        harness
            .negotiator
            .send(LinkEvent::Connected {
                remote: RemoteMediaHandle::default(),
            })
            .await;
        harness.wait_for(CallState::Connected).await;

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(harness.channels.current.borrow().duration_seconds, 10);

        let mut queued = Vec::new();
        while let Ok(snapshot) = updates.try_recv() {
            queued.push(snapshot);
        }
        // Idle, Initializing, Connecting, Ringing, Connected, first quality
        assert_eq!(queued.len(), 6);
        assert!(queued.iter().all(|s| s.duration_seconds == 0));
    }

    #[tokio::test]
    async fn test_feed_closes_when_controller_stops() {
        let harness = Harness::new();
        let mut early = harness.channels.updates.subscribe();
        let ControllerChannels {
            commands,
            updates,
            task,
            ..
        } = harness.channels;
        drop(commands);
        task.await.unwrap();

        assert!(early.recv().await.is_none());
        assert!(updates.subscribe().recv().await.is_none());
    }
}
