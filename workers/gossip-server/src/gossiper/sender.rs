//! The shared push machinery both gossiper variants delegate to
//!
//! Partner selection happens on the timer thread; encoding and the actual
//! transport send are offloaded to the bounded worker pool so that a slow
//! peer never stalls the schedule.

use std::sync::Arc;

use common::{
    clock::Clock,
    types::member::{Endpoint, Member},
};
use gossip_api::{
    codec::ProtocolCodec,
    message::{
        GossipMessage, MembershipListMessage, PerNodeDataMessage, SharedDataMessage,
        ShutdownMessage, MAX_ADVERTISED_MEMBERS,
    },
    transport::Transport,
};
use rand::{
    seq::{IteratorRandom, SliceRandom},
    thread_rng,
};
use state::GossipState;
use tracing::warn;

use crate::pool::WorkerPool;

use super::{tier_candidates, Tier};

/// Builds and sends outbound pushes
pub struct GossipSender {
    /// The node state snapshots are taken from
    state: Arc<GossipState>,
    /// The codec frames are encoded with
    codec: Arc<dyn ProtocolCodec>,
    /// The transport frames are handed to
    transport: Arc<dyn Transport>,
    /// The pool push work runs on
    pool: Arc<WorkerPool>,
}

impl GossipSender {
    /// Constructor
    pub fn new(
        state: Arc<GossipState>,
        codec: Arc<dyn ProtocolCodec>,
        transport: Arc<dyn Transport>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self { state, codec, transport, pool }
    }

    /// The node state this sender pushes from
    pub fn state(&self) -> &Arc<GossipState> {
        &self.state
    }

    // ------------------------
    // | Uniform-partner push |
    // ------------------------

    /// Push a membership list to one uniformly chosen live peer
    pub fn gossip_membership(&self) {
        self.gossip_membership_filtered(self.state.membership().snapshot_live());
    }

    /// Push all per-node data to one uniformly chosen live peer
    pub fn gossip_per_node(&self) {
        self.gossip_per_node_filtered(self.state.membership().snapshot_live());
    }

    /// Push all shared data to one uniformly chosen live peer
    pub fn gossip_shared(&self) {
        self.gossip_shared_filtered(self.state.membership().snapshot_live());
    }

    /// Ping one uniformly chosen DOWN peer with a membership list
    ///
    /// This is how seeded and partitioned peers are coaxed back: a DOWN peer
    /// still accepts heartbeats and may answer with its own gossip
    pub fn ping_dead_peer(&self) {
        self.gossip_membership_filtered(self.state.membership().snapshot_dead());
    }

    // ----------------------
    // | Tier-filtered push |
    // ----------------------

    /// Push a membership list to one peer of the given tier
    pub fn gossip_membership_tier(&self, tier: Tier) {
        let live = self.state.membership().snapshot_live();
        self.gossip_membership_filtered(tier_candidates(self.state.local(), &live, tier));
    }

    /// Push per-node data to one peer of the given tier
    pub fn gossip_per_node_tier(&self, tier: Tier) {
        let live = self.state.membership().snapshot_live();
        self.gossip_per_node_filtered(tier_candidates(self.state.local(), &live, tier));
    }

    /// Push shared data to one peer of the given tier
    pub fn gossip_shared_tier(&self, tier: Tier) {
        let live = self.state.membership().snapshot_live();
        self.gossip_shared_filtered(tier_candidates(self.state.local(), &live, tier));
    }

    // ------------
    // | Shutdown |
    // ------------

    /// Announce shutdown to a third of the live peers (at least one)
    ///
    /// Optimistic only; peers that miss the notice convict the local node
    /// through their failure detectors instead
    pub fn shutdown_fanout(&self) {
        let live = self.state.membership().snapshot_live();
        if live.is_empty() {
            return;
        }

        let fanout = std::cmp::max(1, live.len() / 3);
        let message = GossipMessage::Shutdown(ShutdownMessage {
            node_id: self.state.local().node_id().clone(),
        });
        for target in live.choose_multiple(&mut thread_rng(), fanout) {
            self.submit_send(target.endpoint.clone(), message.clone());
        }
    }

    // -----------
    // | Helpers |
    // -----------

    /// Push a membership list to one randomly chosen candidate
    fn gossip_membership_filtered(&self, candidates: Vec<Member>) {
        let target = match candidates.choose(&mut thread_rng()) {
            Some(target) => target,
            None => return,
        };

        let known = self
            .state
            .membership()
            .snapshot_live()
            .into_iter()
            .choose_multiple(&mut thread_rng(), MAX_ADVERTISED_MEMBERS);
        let message = GossipMessage::MembershipList(MembershipListMessage {
            sender: self.local_advertisement(),
            known,
        });
        self.submit_send(target.endpoint.clone(), message);
    }

    /// Push every unexpired per-node datum to one randomly chosen candidate
    fn gossip_per_node_filtered(&self, candidates: Vec<Member>) {
        let target = match candidates.choose(&mut thread_rng()) {
            Some(target) => target,
            None => return,
        };

        let sender = self.local_advertisement();
        for datum in self.state.store().per_node_snapshot() {
            let message =
                GossipMessage::PerNodeData(PerNodeDataMessage { sender: sender.clone(), datum });
            self.submit_send(target.endpoint.clone(), message);
        }
    }

    /// Push every unexpired shared datum to one randomly chosen candidate
    fn gossip_shared_filtered(&self, candidates: Vec<Member>) {
        let target = match candidates.choose(&mut thread_rng()) {
            Some(target) => target,
            None => return,
        };

        let sender = self.local_advertisement();
        for datum in self.state.store().shared_snapshot() {
            let message =
                GossipMessage::SharedData(SharedDataMessage { sender: sender.clone(), datum });
            self.submit_send(target.endpoint.clone(), message);
        }
    }

    /// The local member stamped with a freshly advanced heartbeat
    fn local_advertisement(&self) -> Member {
        let now_ns = self.state.clock().now_ns();
        self.state.local().advance_heartbeat(now_ns);
        self.state.local().snapshot()
    }

    /// Encode and send on the worker pool
    fn submit_send(&self, endpoint: Endpoint, message: GossipMessage) {
        let codec = self.codec.clone();
        let transport = self.transport.clone();

        self.pool.submit(move || match codec.encode(&message) {
            Ok(frame) => {
                if let Err(err) = transport.send(&endpoint, &frame) {
                    warn!("push to {endpoint} failed: {err}");
                }
            },
            Err(err) => warn!("dropping unencodable push: {err}"),
        });
    }
}
