//! Property tests for the session transition table and quality policy

#![allow(clippy::unwrap_used)]

use proptest::prelude::*;
use saorsa_call_core::{CallState, LinkStats, QualityClass, QualityPolicy, ThresholdPolicy};
use std::time::Duration;

const ALL_STATES: [CallState; 7] = [
    CallState::Idle,
    CallState::Initializing,
    CallState::Connecting,
    CallState::Ringing,
    CallState::Connected,
    CallState::Ended,
    CallState::Failed,
];

fn any_state() -> impl Strategy<Value = CallState> {
    prop::sample::select(ALL_STATES.to_vec())
}

fn rank(class: QualityClass) -> u8 {
    match class {
        QualityClass::Excellent => 3,
        QualityClass::Good => 2,
        QualityClass::Poor => 1,
        QualityClass::Disconnected => 0,
    }
}

#[test]
fn terminal_states_have_no_exits() {
    for from in [CallState::Ended, CallState::Failed] {
        for to in ALL_STATES {
            assert!(!from.can_transition_to(to), "{:?} -> {:?}", from, to);
        }
    }
}

#[test]
fn connected_is_only_reached_through_ringing() {
    for from in ALL_STATES {
        assert_eq!(
            from.can_transition_to(CallState::Connected),
            from == CallState::Ringing
        );
    }
    assert!(!CallState::Connected.can_transition_to(CallState::Failed));
}

proptest! {
    #[test]
    fn walks_settle_at_most_once(requests in prop::collection::vec(any_state(), 0..40)) {
        let mut state = CallState::Idle;
        let mut settled = 0;
        for to in requests {
            if state.can_transition_to(to) {
                state = to;
                if state.is_terminal() {
                    settled += 1;
                }
            }
        }
        prop_assert!(settled <= 1);
        if settled == 1 {
            prop_assert!(state.is_terminal());
        }
    }

    #[test]
    fn no_edge_returns_to_idle(from in any_state()) {
        prop_assert!(!from.can_transition_to(CallState::Idle));
        prop_assert!(!from.can_transition_to(from));
    }

    #[test]
    fn more_loss_never_improves_quality(
        loss in 0.0f32..1.0,
        extra in 0.0f32..0.5,
        rtt_ms in 0u64..2_000,
    ) {
        let policy = ThresholdPolicy::default();
        let rtt = Some(Duration::from_millis(rtt_ms));
        let better = policy.classify(&LinkStats { packet_loss: loss, rtt, connected: true });
        let worse = policy.classify(&LinkStats {
            packet_loss: (loss + extra).min(1.0),
            rtt,
            connected: true,
        });
        prop_assert!(rank(worse) <= rank(better));
    }

    #[test]
    fn disconnected_links_classify_disconnected(loss in 0.0f32..1.0, rtt_ms in 0u64..2_000) {
        let policy = ThresholdPolicy::default();
        let class = policy.classify(&LinkStats {
            packet_loss: loss,
            rtt: Some(Duration::from_millis(rtt_ms)),
            connected: false,
        });
        prop_assert_eq!(class, QualityClass::Disconnected);
    }
}
