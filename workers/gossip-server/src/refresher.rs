//! The membership state refresher
//!
//! On a fixed cadence, converts each peer's phi score into an UP or DOWN
//! verdict. A peer that has never produced an arrival stays DOWN no matter
//! how innocent its (empty) statistics look; everything else is UP exactly
//! while phi sits below the conviction threshold.

use std::{sync::Arc, time::Duration};

use common::{
    clock::Clock,
    types::{member::PeerState, CancelChannel},
};
use state::GossipState;

use crate::{errors::GossipError, timers::RepeatingTimer};

/// Recompute every peer's verdict from the failure detector
pub fn refresh_verdicts(state: &GossipState) {
    let now_ns = state.clock().now_ns();
    let detector = state.detector();
    let threshold = detector.conviction_threshold();

    for (member, _) in state.membership().snapshot_all() {
        let key = member.key();

        let verdict = if detector.has_arrivals(&member.node_id)
            && detector.phi(&member.node_id, now_ns) < threshold
        {
            PeerState::Up
        } else {
            PeerState::Down
        };

        state.membership().set_state(&key, verdict);
    }
}

/// Start the repeating refresh task
pub fn start_refresher(
    state: Arc<GossipState>,
    period: Duration,
    cancel: CancelChannel,
) -> Result<RepeatingTimer, GossipError> {
    RepeatingTimer::spawn("membership-refresher", period, cancel, move || {
        refresh_verdicts(&state)
    })
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use common::{
        clock::{mocks::MockClock, Clock},
        types::{
            member::{Endpoint, Member, PeerState},
            NodeId,
        },
    };
    use config::FailureDetectorConfig;
    use state::GossipState;

    use super::refresh_verdicts;

    /// The heartbeat period used by these tests, in nanoseconds
    const PERIOD_NS: u64 = 100_000_000;

    /// Builds state with one remote peer seeded
    fn state_with_peer() -> (Arc<GossipState>, Member, Arc<MockClock>) {
        let clock = Arc::new(MockClock::new());
        let local =
            Member::new("cluster", NodeId::from("local"), Endpoint::new("udp", "10.0.0.1", 9000));
        let state =
            Arc::new(GossipState::new(local, FailureDetectorConfig::default(), clock.clone()));

        let peer =
            Member::new("cluster", NodeId::from("peer"), Endpoint::new("udp", "10.0.0.2", 9000));
        state.membership().seed(peer.clone());
        (state, peer, clock)
    }

    /// Tests that a seeded peer with no arrivals stays DOWN
    #[test]
    fn test_seeded_peer_stays_down() {
        let (state, peer, _clock) = state_with_peer();

        refresh_verdicts(&state);
        assert_eq!(state.membership().state_of(&peer.key()), Some(PeerState::Down));
    }

    /// Tests elevation on arrivals and conviction after silence
    #[test]
    fn test_up_then_down() {
        let (state, peer, clock) = state_with_peer();

        // Steady heartbeats elevate the peer
        for round in 1..=20u64 {
            clock.advance_ms(PERIOD_NS / 1_000_000);
            let mut advert = peer.clone();
            advert.heartbeat = round;
            state.membership().upsert_from_heartbeat(advert, clock.now_ns());
        }
        refresh_verdicts(&state);
        assert_eq!(state.membership().state_of(&peer.key()), Some(PeerState::Up));

        // A long silence convicts it again
        clock.advance_ms(100 * PERIOD_NS / 1_000_000);
        refresh_verdicts(&state);
        assert_eq!(state.membership().state_of(&peer.key()), Some(PeerState::Down));
    }
}
