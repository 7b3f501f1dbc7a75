//! The message kinds exchanged between gossip peers

use common::types::{
    datum::{PerNodeDatum, SharedDatum},
    member::Member,
    NodeId,
};
use serde::{Deserialize, Serialize};

/// The maximum number of known members a membership push advertises
///
/// Bounding the sample keeps membership frames small; the epidemic exchange
/// spreads the rest of the view over subsequent rounds
pub const MAX_ADVERTISED_MEMBERS: usize = 16;

/// A message sent between gossip peers
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum GossipMessage {
    /// The sender's view of the membership ring
    MembershipList(MembershipListMessage),
    /// A per-node datum owned by its originating node
    PerNodeData(PerNodeDataMessage),
    /// A shared datum, possibly CRDT-merged on receipt
    SharedData(SharedDataMessage),
    /// An optimistic notice that the sender is shutting down
    Shutdown(ShutdownMessage),
}

/// The sender's self-advertisement plus a bounded sample of its live view
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MembershipListMessage {
    /// The sending member, carrying its current heartbeat counter
    pub sender: Member,
    /// A sample of other members the sender has learned of, each with the
    /// last heartbeat the sender observed for it
    pub known: Vec<Member>,
}

/// Carries one per-node datum
///
/// The sender rides along so that data traffic doubles as a heartbeat
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PerNodeDataMessage {
    /// The sending member, carrying its current heartbeat counter
    pub sender: Member,
    /// The datum; its node ID names the owning node
    pub datum: PerNodeDatum,
}

/// Carries one shared datum
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SharedDataMessage {
    /// The sending member, carrying its current heartbeat counter
    pub sender: Member,
    /// The datum
    pub datum: SharedDatum,
}

/// Announces that a node is leaving the cluster
///
/// Delivery is best-effort; the failure detector converges on the same
/// answer without it
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ShutdownMessage {
    /// The node shutting down
    pub node_id: NodeId,
}
