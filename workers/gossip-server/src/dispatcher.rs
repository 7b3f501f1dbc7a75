//! Routes decoded inbound messages into the membership table and data store
//!
//! The dispatcher performs no I/O and never calls back into the gossiper;
//! it only mutates state, so it is safe to invoke from any transport thread.

use std::sync::Arc;

use common::{clock::Clock, types::member::Member};
use gossip_api::message::{
    GossipMessage, MembershipListMessage, PerNodeDataMessage, SharedDataMessage, ShutdownMessage,
};
use state::GossipState;
use tracing::{debug, info};

/// Applies inbound messages to the node's state
pub struct MessageDispatcher {
    /// The state mutated by inbound traffic
    state: Arc<GossipState>,
}

impl MessageDispatcher {
    /// Constructor
    pub fn new(state: Arc<GossipState>) -> Self {
        Self { state }
    }

    /// Route one decoded message
    pub fn dispatch(&self, message: GossipMessage) {
        match message {
            GossipMessage::MembershipList(message) => self.handle_membership_list(message),
            GossipMessage::PerNodeData(message) => self.handle_per_node_data(message),
            GossipMessage::SharedData(message) => self.handle_shared_data(message),
            GossipMessage::Shutdown(message) => self.handle_shutdown(message),
        }
    }

    /// Apply a membership advertisement: the sender itself plus the sample
    /// of members it vouches for
    fn handle_membership_list(&self, message: MembershipListMessage) {
        self.observe_member(message.sender);
        for member in message.known {
            self.observe_member(member);
        }
    }

    /// Apply a per-node datum, crediting the sender's heartbeat
    fn handle_per_node_data(&self, message: PerNodeDataMessage) {
        self.observe_member(message.sender);
        self.state.store().add_per_node(message.datum);
    }

    /// Apply a shared datum, crediting the sender's heartbeat
    fn handle_shared_data(&self, message: SharedDataMessage) {
        self.observe_member(message.sender);
        self.state.store().add_shared(message.datum);
    }

    /// Force a departing peer DOWN without waiting for the detector
    fn handle_shutdown(&self, message: ShutdownMessage) {
        match self.state.membership().key_of(&message.node_id) {
            Some(key) => {
                info!("peer {} announced shutdown", message.node_id);
                self.state.membership().force_down(&key);
            },
            None => debug!("shutdown notice for unknown peer {}", message.node_id),
        }
    }

    /// Upsert an advertised member, ignoring advertisements of the local
    /// node; the local member is never indexed in the table
    fn observe_member(&self, member: Member) {
        if member.node_id == *self.state.local().node_id() {
            return;
        }

        let now_ns = self.state.clock().now_ns();
        self.state.membership().upsert_from_heartbeat(member, now_ns);
    }
}
