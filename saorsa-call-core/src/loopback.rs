//! In-process simulated remote peer
//!
//! [`LoopbackNegotiator`] plays the remote side of a call from a
//! [`LoopbackScript`]: when it rings, whether it answers, when it hangs up and
//! what link statistics it reports. It goes through the same
//! [`PeerNegotiator`] seam as the real transport, which makes the call
//! controller testable without sockets and lets the CLI demo a call.

use crate::contact::PeerContact;
use crate::media::MediaHandle;
use crate::negotiator::{
    LinkEvent, LinkState, Negotiation, NegotiationError, NegotiatorConfig, PeerLink,
    PeerNegotiator, RemoteMediaHandle, RemoteTrack,
};
use crate::task::TaskGuard;
use crate::types::{CallId, LinkStats};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// How the simulated remote answers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopbackOutcome {
    /// Accept the call
    Answer,
    /// Negotiation fails with this message
    Fail(String),
    /// Remote declines while ringing
    Decline,
    /// Remote never answers
    NoAnswer,
}

/// Script for the simulated remote
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopbackScript {
    /// Delay before the remote starts ringing
    pub ringing_after: Duration,
    /// Delay between ringing and the outcome
    pub answer_after: Duration,
    /// What happens after ringing
    pub outcome: LoopbackOutcome,
    /// Remote hangs up this long after connecting
    pub hangup_after: Option<Duration>,
    /// Transport drops this long after connecting
    pub drop_after: Option<Duration>,
    /// Stats returned by successive `stats()` calls; the last entry repeats
    pub stats: Vec<LinkStats>,
}

impl Default for LoopbackScript {
    fn default() -> Self {
        Self {
            ringing_after: Duration::from_millis(200),
            answer_after: Duration::from_millis(800),
            outcome: LoopbackOutcome::Answer,
            hangup_after: None,
            drop_after: None,
            stats: Vec::new(),
        }
    }
}

impl LoopbackScript {
    /// Remote that answers after the default delays
    #[must_use]
    pub fn answering() -> Self {
        Self::default()
    }

    /// Remote whose negotiation fails
    #[must_use]
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            outcome: LoopbackOutcome::Fail(reason.into()),
            ..Self::default()
        }
    }

    /// Remote that rings forever
    #[must_use]
    pub fn never_answering() -> Self {
        Self {
            outcome: LoopbackOutcome::NoAnswer,
            ..Self::default()
        }
    }

    /// Replace the stats sequence
    #[must_use]
    pub fn with_stats(mut self, stats: Vec<LinkStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Remote hangs up after `after` connected
    #[must_use]
    pub fn with_hangup_after(mut self, after: Duration) -> Self {
        self.hangup_after = Some(after);
        self
    }
}

struct LinkInner {
    state: Mutex<LinkState>,
    remote: Mutex<Option<RemoteMediaHandle>>,
    stats: Mutex<(Vec<LinkStats>, usize)>,
}

impl LinkInner {
    fn set_state(&self, state: LinkState) -> bool {
        let mut current = self.state.lock();
        if *current == LinkState::Closed {
            return false;
        }
        *current = state;
        true
    }
}

/// Link produced by [`LoopbackNegotiator`]
pub struct LoopbackLink {
    inner: Arc<LinkInner>,
    task: Mutex<Option<TaskGuard>>,
    close_calls: AtomicUsize,
    effective_closes: AtomicUsize,
}

impl LoopbackLink {
    /// Number of `close` invocations
    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::Acquire)
    }

    /// Number of `close` invocations that actually tore the link down
    #[must_use]
    pub fn effective_closes(&self) -> usize {
        self.effective_closes.load(Ordering::Acquire)
    }

    /// Whether the scripted remote is still running
    #[must_use]
    pub fn negotiation_active(&self) -> bool {
        self.task.lock().as_ref().is_some_and(TaskGuard::is_active)
    }
}

#[async_trait]
impl PeerLink for LoopbackLink {
    fn negotiation_state(&self) -> LinkState {
        *self.inner.state.lock()
    }

    fn remote_media(&self) -> Option<RemoteMediaHandle> {
        self.inner.remote.lock().clone()
    }

    async fn stats(&self) -> Result<LinkStats, NegotiationError> {
        match self.negotiation_state() {
            LinkState::Closed => return Err(NegotiationError::Closed),
            LinkState::Disconnected | LinkState::Failed => return Ok(LinkStats::lost()),
            _ => {}
        }
        let mut guard = self.inner.stats.lock();
        let (sequence, cursor) = &mut *guard;
        let stats = match sequence.get(*cursor).or_else(|| sequence.last()) {
            Some(stats) => stats.clone(),
            None => LinkStats::healthy(Duration::from_millis(40)),
        };
        if *cursor < sequence.len() {
            *cursor += 1;
        }
        Ok(stats)
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::AcqRel);
        if let Some(mut task) = self.task.lock().take() {
            task.cancel();
        }
        let was_open = {
            let mut state = self.inner.state.lock();
            let was_open = *state != LinkState::Closed;
            *state = LinkState::Closed;
            was_open
        };
        if was_open {
            self.effective_closes.fetch_add(1, Ordering::AcqRel);
            tracing::debug!("Loopback link closed");
        }
    }
}

/// Negotiator whose remote side is a [`LoopbackScript`]
pub struct LoopbackNegotiator {
    script: Mutex<LoopbackScript>,
    config: NegotiatorConfig,
    connects: AtomicUsize,
    last_link: Mutex<Option<Arc<LoopbackLink>>>,
}

impl LoopbackNegotiator {
    /// Create a negotiator playing `script`
    #[must_use]
    pub fn new(script: LoopbackScript) -> Self {
        Self {
            script: Mutex::new(script),
            config: NegotiatorConfig::default(),
            connects: AtomicUsize::new(0),
            last_link: Mutex::new(None),
        }
    }

    /// Replace the script used by subsequent connects
    pub fn set_script(&self, script: LoopbackScript) {
        *self.script.lock() = script;
    }

    /// Number of `connect` calls so far
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::Acquire)
    }

    /// Most recently created link
    ///
    /// Only the latest link is kept; earlier ones are dropped by the next connect.
    #[must_use]
    pub fn last_link(&self) -> Option<Arc<LoopbackLink>> {
        self.last_link.lock().clone()
    }
}

#[async_trait]
impl PeerNegotiator for LoopbackNegotiator {
    #[tracing::instrument(skip(self, peer, media), fields(peer = %peer.identity))]
    async fn connect(
        &self,
        call_id: CallId,
        peer: &PeerContact,
        media: &MediaHandle,
    ) -> Result<Negotiation, NegotiationError> {
        let script = self.script.lock().clone();
        let inner = Arc::new(LinkInner {
            state: Mutex::new(LinkState::New),
            remote: Mutex::new(None),
            stats: Mutex::new((script.stats.clone(), 0)),
        });

        // the simulated remote mirrors whatever we send
        let remote = RemoteMediaHandle {
            tracks: media
                .track_ids()
                .into_iter()
                .map(|(kind, id)| RemoteTrack {
                    kind,
                    id: format!("remote-{}", id),
                })
                .collect(),
        };

        let (tx, rx) = mpsc::channel(self.config.event_capacity);
        let task = TaskGuard::spawn(
            "loopback-remote",
            run_script(script, Arc::clone(&inner), remote, tx),
        );

        let link = Arc::new(LoopbackLink {
            inner,
            task: Mutex::new(Some(task)),
            close_calls: AtomicUsize::new(0),
            effective_closes: AtomicUsize::new(0),
        });
        *self.last_link.lock() = Some(Arc::clone(&link));
        self.connects.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(call_id = %call_id, "Loopback negotiation started");

        Ok(Negotiation {
            link,
            events: rx,
        })
    }
}

async fn run_script(
    script: LoopbackScript,
    inner: Arc<LinkInner>,
    remote: RemoteMediaHandle,
    tx: mpsc::Sender<LinkEvent>,
) {
    use tokio::time::sleep;

    if !inner.set_state(LinkState::Connecting) || tx.send(LinkEvent::Connecting).await.is_err() {
        return;
    }
    sleep(script.ringing_after).await;
    if tx.send(LinkEvent::Ringing).await.is_err() {
        return;
    }
    sleep(script.answer_after).await;

    match script.outcome {
        LoopbackOutcome::Answer => {
            if !inner.set_state(LinkState::Connected) {
                return;
            }
            *inner.remote.lock() = Some(remote.clone());
            if tx.send(LinkEvent::Connected { remote }).await.is_err() {
                return;
            }
            match (script.hangup_after, script.drop_after) {
                (Some(after), _) => {
                    sleep(after).await;
                    let _ = tx
                        .send(LinkEvent::RemoteHangup {
                            reason: Some("remote hung up".to_string()),
                        })
                        .await;
                }
                (None, Some(after)) => {
                    sleep(after).await;
                    if inner.set_state(LinkState::Disconnected) {
                        let _ = tx.send(LinkEvent::Disconnected).await;
                    }
                }
                // stay connected until closed
                (None, None) => std::future::pending::<()>().await,
            }
        }
        LoopbackOutcome::Fail(reason) => {
            if inner.set_state(LinkState::Failed) {
                let _ = tx.send(LinkEvent::Failed(reason)).await;
            }
        }
        LoopbackOutcome::Decline => {
            let _ = tx
                .send(LinkEvent::RemoteHangup {
                    reason: Some("declined".to_string()),
                })
                .await;
        }
        LoopbackOutcome::NoAnswer => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::media::{MediaResourceManager, VirtualCaptureBackend};
    use crate::types::{CallType, MediaKind};

    async fn video_media() -> MediaHandle {
        MediaResourceManager::new(Arc::new(VirtualCaptureBackend::new()))
            .acquire(CallType::Video)
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_answering_script_event_order() {
        let negotiator = LoopbackNegotiator::new(LoopbackScript::answering());
        let media = video_media().await;
        let mut negotiation = negotiator
            .connect(CallId::new(), &PeerContact::new("bob"), &media)
            .await
            .unwrap();

        assert_eq!(negotiation.events.recv().await, Some(LinkEvent::Connecting));
        assert_eq!(negotiation.events.recv().await, Some(LinkEvent::Ringing));
        match negotiation.events.recv().await {
            Some(LinkEvent::Connected { remote }) => {
                assert!(remote.has(MediaKind::Audio));
                assert!(remote.has(MediaKind::Video));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(negotiation.link.negotiation_state(), LinkState::Connected);
        assert!(negotiation.link.remote_media().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_mid_negotiation_cancels() {
        let negotiator = LoopbackNegotiator::new(LoopbackScript::never_answering());
        let media = video_media().await;
        let mut negotiation = negotiator
            .connect(CallId::new(), &PeerContact::new("bob"), &media)
            .await
            .unwrap();
        assert_eq!(negotiation.events.recv().await, Some(LinkEvent::Connecting));

        negotiation.link.close().await;
        negotiation.link.close().await;

        let link = negotiator.last_link().unwrap();
        assert_eq!(link.close_calls(), 2);
        assert_eq!(link.effective_closes(), 1);
        assert!(!link.negotiation_active());
        assert!(negotiation.link.is_closed());
        // the remote task is gone, so the event stream ends without connecting
        while let Some(event) = negotiation.events.recv().await {
            assert!(!matches!(event, LinkEvent::Connected { .. }));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_sequence_repeats_last() {
        let script = LoopbackScript {
            ringing_after: Duration::ZERO,
            answer_after: Duration::ZERO,
            ..LoopbackScript::answering()
        }
        .with_stats(vec![
            LinkStats::healthy(Duration::from_millis(20)),
            LinkStats::lost(),
        ]);
        let negotiator = LoopbackNegotiator::new(script);
        let media = video_media().await;
        let negotiation = negotiator
            .connect(CallId::new(), &PeerContact::new("bob"), &media)
            .await
            .unwrap();

        assert!(negotiation.link.stats().await.unwrap().connected);
        assert!(!negotiation.link.stats().await.unwrap().connected);
        assert!(!negotiation.link.stats().await.unwrap().connected);

        negotiation.link.close().await;
        assert_eq!(
            negotiation.link.stats().await,
            Err(NegotiationError::Closed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_latest_link_is_kept() {
        let negotiator = LoopbackNegotiator::new(LoopbackScript::answering());
        let media = video_media().await;
        let mut links = Vec::new();
        for _ in 0..3 {
            let negotiation = negotiator
                .connect(CallId::new(), &PeerContact::new("bob"), &media)
                .await
                .unwrap();
            links.push(Arc::downgrade(&negotiator.last_link().unwrap()));
            negotiation.link.close().await;
        }

        assert_eq!(negotiator.connect_count(), 3);
        assert!(links[0].upgrade().is_none());
        assert!(links[1].upgrade().is_none());
        let last = links[2].upgrade().unwrap();
        assert!(Arc::ptr_eq(&last, &negotiator.last_link().unwrap()));
        assert_eq!(last.effective_closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_script() {
        let negotiator = LoopbackNegotiator::new(LoopbackScript::failing("ice failed"));
        let media = video_media().await;
        let mut negotiation = negotiator
            .connect(CallId::new(), &PeerContact::new("bob"), &media)
            .await
            .unwrap();

        let mut last = None;
        while let Some(event) = negotiation.events.recv().await {
            last = Some(event);
        }
        assert_eq!(last, Some(LinkEvent::Failed("ice failed".to_string())));
        assert_eq!(negotiation.link.negotiation_state(), LinkState::Failed);
    }
}
