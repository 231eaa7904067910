//! Connection quality monitoring
//!
//! A [`QualityMonitor`] owns one sampling task per connected session. Every
//! interval it reads [`LinkStats`] from the peer link, classifies them with a
//! [`QualityPolicy`] and publishes a [`QualitySample`] whenever the
//! classification changes. Samples go out on a single ordered channel, so a
//! consumer sees degrade-then-recover sequences exactly as they were sampled.

use crate::negotiator::PeerLink;
use crate::task::{CancelFlag, TaskGuard};
use crate::types::{LinkStats, QualityClass, QualitySample};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Default sampling interval
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Maps link statistics onto a quality class
pub trait QualityPolicy: Send + Sync {
    /// Classify one observation
    fn classify(&self, stats: &LinkStats) -> QualityClass;
}

/// Threshold-based classification on packet loss and round-trip time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdPolicy {
    /// Loss at or above which the link counts as disconnected
    pub disconnected_loss: f32,
    /// Upper loss bound for `Excellent`
    pub excellent_loss: f32,
    /// Upper RTT bound for `Excellent`
    pub excellent_rtt: Duration,
    /// Upper loss bound for `Good`
    pub good_loss: f32,
    /// Upper RTT bound for `Good`
    pub good_rtt: Duration,
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self {
            disconnected_loss: 0.25,
            excellent_loss: 0.01,
            excellent_rtt: Duration::from_millis(150),
            good_loss: 0.05,
            good_rtt: Duration::from_millis(300),
        }
    }
}

impl QualityPolicy for ThresholdPolicy {
    fn classify(&self, stats: &LinkStats) -> QualityClass {
        if !stats.connected || stats.packet_loss >= self.disconnected_loss {
            return QualityClass::Disconnected;
        }
        // an unmeasured RTT does not count against the link
        let rtt = stats.rtt.unwrap_or_default();
        if stats.packet_loss < self.excellent_loss && rtt < self.excellent_rtt {
            QualityClass::Excellent
        } else if stats.packet_loss < self.good_loss && rtt < self.good_rtt {
            QualityClass::Good
        } else {
            QualityClass::Poor
        }
    }
}

/// Periodic sampler bound to one peer link
pub struct QualityMonitor {
    task: TaskGuard,
}

impl QualityMonitor {
    /// Start sampling `link` every `interval`
    ///
    /// The first tick fires immediately. Returns the monitor and the ordered
    /// stream of classification changes.
    #[must_use]
    pub fn start(
        link: Arc<dyn PeerLink>,
        interval: Duration,
        policy: Arc<dyn QualityPolicy>,
    ) -> (Self, mpsc::Receiver<QualitySample>) {
        let (tx, rx) = mpsc::channel(16);
        let task = TaskGuard::spawn("quality-monitor", sample_loop(link, interval, policy, tx));
        tracing::debug!(interval_ms = interval.as_millis(), "Quality monitor started");
        (Self { task }, rx)
    }

    /// Cancel the sampling task; idempotent
    pub fn stop(&mut self) {
        if !self.task.is_cancelled() {
            self.task.cancel();
            tracing::debug!("Quality monitor stopped");
        }
    }

    /// Whether the sampling task is still alive
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.is_active()
    }

    /// Cancelled flag, readable after the monitor is dropped
    #[must_use]
    pub fn cancel_flag(&self) -> CancelFlag {
        self.task.cancel_flag()
    }
}

async fn sample_loop(
    link: Arc<dyn PeerLink>,
    interval: Duration,
    policy: Arc<dyn QualityPolicy>,
    tx: mpsc::Sender<QualitySample>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last: Option<QualityClass> = None;

    loop {
        ticker.tick().await;
        let stats = match link.stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::debug!(error = %e, "Link stats unavailable");
                None
            }
        };
        let classification = stats
            .as_ref()
            .map_or(QualityClass::Disconnected, |s| policy.classify(s));

        if last == Some(classification) {
            continue;
        }
        tracing::debug!(
            previous = ?last,
            current = %classification,
            "Quality classification changed"
        );
        last = Some(classification);

        let sample = QualitySample {
            timestamp: Utc::now(),
            classification,
            stats,
        };
        if tx.send(sample).await.is_err() {
            break;
        }
    }
}
