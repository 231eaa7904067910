//! Caller-facing call controls
//!
//! A [`ControlSurface`] is the handle a UI holds for one call screen. Every
//! method is a request to the surface's controller task, so calls from
//! several tasks are applied one after another and always observe a
//! consistent session. Clones share the same controller; when the last clone
//! is dropped the controller disposes the session and stops.

use crate::call::{CallDeps, CallError, CallSessionController, Command, SnapshotFeed};
use crate::contact::PeerContact;
use crate::types::{
    CallId, CallState, CallType, CommandOutcome, MediaKind, SessionDiagnostics, SessionSnapshot,
};
use futures::Stream;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

struct SurfaceInner {
    commands: mpsc::Sender<Command>,
    updates: Arc<SnapshotFeed>,
    current: watch::Receiver<SessionSnapshot>,
    fullscreen: AtomicBool,
    // taken by the first dispose
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Control handle for one call session at a time
#[derive(Clone)]
pub struct ControlSurface {
    inner: Arc<SurfaceInner>,
}

impl std::fmt::Debug for ControlSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSurface")
            .field("state", &self.state())
            .field("fullscreen", &self.is_fullscreen())
            .finish()
    }
}

impl ControlSurface {
    pub(crate) fn spawn(deps: CallDeps) -> Self {
        let channels = CallSessionController::spawn(deps);
        Self {
            inner: Arc::new(SurfaceInner {
                commands: channels.commands,
                updates: channels.updates,
                current: channels.current,
                fullscreen: AtomicBool::new(false),
                task: Mutex::new(Some(channels.task)),
            }),
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .commands
            .send(make(tx))
            .await
            .map_err(|_| CallError::ControllerClosed)?;
        rx.await.map_err(|_| CallError::ControllerClosed)
    }

    /// Start a call to `peer`
    ///
    /// Returns once the session exists and device acquisition has begun;
    /// progress is reported through [`subscribe`](Self::subscribe).
    ///
    /// # Errors
    ///
    /// Returns `SessionActive` if a call is already in progress
    pub async fn start(&self, peer: PeerContact, call_type: CallType) -> Result<CallId, CallError> {
        self.request(|reply| Command::Start {
            peer,
            call_type,
            reply,
        })
        .await?
    }

    /// Disable the microphone track
    ///
    /// # Errors
    ///
    /// Returns `NoSession` before the first call
    pub async fn mute(&self) -> Result<CommandOutcome, CallError> {
        self.set_track(MediaKind::Audio, Some(false)).await
    }

    /// Re-enable the microphone track
    ///
    /// # Errors
    ///
    /// Returns `NoSession` before the first call
    pub async fn unmute(&self) -> Result<CommandOutcome, CallError> {
        self.set_track(MediaKind::Audio, Some(true)).await
    }

    /// Flip the microphone track
    ///
    /// # Errors
    ///
    /// Returns `NoSession` before the first call
    pub async fn toggle_mute(&self) -> Result<CommandOutcome, CallError> {
        self.set_track(MediaKind::Audio, None).await
    }

    /// Re-enable the camera track
    ///
    /// # Errors
    ///
    /// Returns `NotVideoCall` on a voice call
    pub async fn enable_video(&self) -> Result<CommandOutcome, CallError> {
        self.set_track(MediaKind::Video, Some(true)).await
    }

    /// Disable the camera track without releasing the camera
    ///
    /// # Errors
    ///
    /// Returns `NotVideoCall` on a voice call
    pub async fn disable_video(&self) -> Result<CommandOutcome, CallError> {
        self.set_track(MediaKind::Video, Some(false)).await
    }

    /// Flip the camera track
    ///
    /// # Errors
    ///
    /// Returns `NotVideoCall` on a voice call
    pub async fn toggle_video(&self) -> Result<CommandOutcome, CallError> {
        self.set_track(MediaKind::Video, None).await
    }

    async fn set_track(
        &self,
        kind: MediaKind,
        enabled: Option<bool>,
    ) -> Result<CommandOutcome, CallError> {
        self.request(|reply| Command::SetTrack {
            kind,
            enabled,
            reply,
        })
        .await?
    }

    /// Flip the presentation flag and return the new value
    ///
    /// Purely local to the surface; the session is not involved.
    pub fn fullscreen_toggle(&self) -> bool {
        let now = !self.inner.fullscreen.fetch_xor(true, Ordering::AcqRel);
        tracing::debug!(fullscreen = now, "Fullscreen toggled");
        now
    }

    /// Current presentation flag
    #[must_use]
    pub fn is_fullscreen(&self) -> bool {
        self.inner.fullscreen.load(Ordering::Acquire)
    }

    /// Hang up or cancel the current call
    ///
    /// A second `end` on a finished session reports `AlreadyEnded`.
    ///
    /// # Errors
    ///
    /// Returns `NoSession` before the first call
    pub async fn end(&self) -> Result<CommandOutcome, CallError> {
        self.request(|reply| Command::End { reply }).await?
    }

    /// Start a fresh session with the same peer and call type
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless the current session is `Failed`
    pub async fn retry(&self) -> Result<CallId, CallError> {
        self.request(|reply| Command::Retry { reply }).await?
    }

    /// Latest published snapshot
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.current.borrow().clone()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> CallState {
        self.inner.current.borrow().state
    }

    /// Receive every change published from now on, in order
    ///
    /// Nothing is dropped for a slow reader. The per-second duration refresh
    /// is only visible through [`snapshot`](Self::snapshot) and
    /// [`wait_until`](Self::wait_until). The receiver yields `None` once the
    /// controller has stopped and the queue is drained.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionSnapshot> {
        self.inner.updates.subscribe()
    }

    /// [`subscribe`](Self::subscribe) as a stream
    pub fn updates(&self) -> impl Stream<Item = SessionSnapshot> + Send + Unpin + 'static {
        UnboundedReceiverStream::new(self.subscribe())
    }

    /// Wait until a snapshot satisfies `predicate`, checking the current one first
    ///
    /// # Errors
    ///
    /// Returns `ControllerClosed` if the controller stops first
    pub async fn wait_until(
        &self,
        mut predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot, CallError> {
        let mut current = self.inner.current.clone();
        let snapshot = current
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| CallError::ControllerClosed)?;
        Ok(snapshot.clone())
    }

    /// Liveness of the session's resources
    ///
    /// # Errors
    ///
    /// Returns `ControllerClosed` after dispose
    pub async fn diagnostics(&self) -> Result<SessionDiagnostics, CallError> {
        self.request(|reply| Command::Diagnostics { reply }).await
    }

    /// End any live session, release everything and stop the controller
    ///
    /// Returns once the controller task has finished. Idempotent; later
    /// commands fail with `ControllerClosed`.
    pub async fn dispose(&self) {
        if self
            .request(|reply| Command::Dispose { reply })
            .await
            .is_err()
        {
            tracing::trace!("Control surface already disposed");
        }
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Call session controller did not stop cleanly");
            }
        }
    }

    /// Whether the controller task is gone
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.commands.is_closed()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::analytics::TracingAnalytics;
    use crate::call::CallConfig;
    use crate::loopback::{LoopbackNegotiator, LoopbackScript};
    use crate::media::{MediaResourceManager, VirtualCaptureBackend};
    use crate::quality::ThresholdPolicy;

    fn surface() -> ControlSurface {
        ControlSurface::spawn(CallDeps {
            media: MediaResourceManager::new(Arc::new(VirtualCaptureBackend::new())),
            negotiator: Arc::new(LoopbackNegotiator::new(LoopbackScript::answering())),
            policy: Arc::new(ThresholdPolicy::default()),
            analytics: Arc::new(TracingAnalytics),
            config: CallConfig::default(),
        })
    }

    #[tokio::test]
    async fn test_commands_before_start() {
        let surface = surface();
        assert_eq!(surface.state(), CallState::Idle);
        assert_eq!(surface.snapshot(), SessionSnapshot::idle());
        assert_eq!(surface.end().await, Err(CallError::NoSession));
        assert_eq!(surface.mute().await, Err(CallError::NoSession));
        assert_eq!(surface.retry().await, Err(CallError::NoSession));
    }

    #[tokio::test]
    async fn test_fullscreen_is_local() {
        let surface = surface();
        assert!(!surface.is_fullscreen());
        assert!(surface.fullscreen_toggle());
        assert!(surface.clone().is_fullscreen());
        assert!(!surface.fullscreen_toggle());
    }

    #[tokio::test]
    async fn test_dispose_closes_surface() {
        let surface = surface();
        let mut updates = surface.subscribe();
        surface.dispose().await;
        assert!(surface.inner.task.lock().is_none());
        assert!(updates.recv().await.is_none());
        surface.dispose().await;
        assert!(surface.is_disposed());
        assert_eq!(
            surface.diagnostics().await,
            Err(CallError::ControllerClosed)
        );
        assert_eq!(
            surface.start(PeerContact::new("bob"), CallType::Voice).await,
            Err(CallError::ControllerClosed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_sees_connected() {
        let surface = surface();
        surface
            .start(PeerContact::new("bob"), CallType::Voice)
            .await
            .unwrap();
        let snapshot = surface
            .wait_until(|s| s.state == CallState::Connected)
            .await
            .unwrap();
        assert_eq!(snapshot.peer.as_deref(), Some("bob"));
        assert_eq!(surface.end().await, Ok(CommandOutcome::Done));
    }
}
