//! Member and endpoint types for the cluster membership table

use std::{
    collections::BTreeMap,
    fmt::Display,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};

use super::NodeId;

/// The reserved property naming the datacenter a member runs in
pub const DATACENTER_PROPERTY: &str = "datacenter";
/// The reserved property naming the rack a member runs in
pub const RACK_PROPERTY: &str = "rack";

// -------------
// | Endpoints |
// -------------

/// A reachable address for a member, immutable once the peer is known
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Endpoint {
    /// The transport scheme, e.g. `udp`
    pub scheme: String,
    /// The host name or address
    pub host: String,
    /// The port the peer's gossip endpoint listens on
    pub port: u16,
}

impl Endpoint {
    /// Constructor
    pub fn new<S: Into<String>, H: Into<String>>(scheme: S, host: H, port: u16) -> Self {
        Self { scheme: scheme.into(), host: host.into(), port }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

// -----------
// | Members |
// -----------

/// The key a member is indexed under in the membership table
///
/// Ordering is lexicographic on (cluster, node id) so that snapshots of the
/// table iterate in a reproducible order on every node
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct MemberKey {
    /// The cluster the member belongs to
    pub cluster: String,
    /// The member's node ID
    pub node_id: NodeId,
}

impl Display for MemberKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.cluster, self.node_id)
    }
}

/// A member of the cluster as advertised through gossip
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Member {
    /// The name of the cluster the member belongs to
    pub cluster: String,
    /// The member's node ID
    pub node_id: NodeId,
    /// The member's reachable endpoint
    pub endpoint: Endpoint,
    /// Free-form tags attached to the member; `datacenter` and `rack` are
    /// reserved and drive topology-aware gossip rates
    pub properties: BTreeMap<String, String>,
    /// The last heartbeat counter observed from this member
    pub heartbeat: u64,
}

impl Member {
    /// Constructor
    pub fn new<C: Into<String>>(cluster: C, node_id: NodeId, endpoint: Endpoint) -> Self {
        Self {
            cluster: cluster.into(),
            node_id,
            endpoint,
            properties: BTreeMap::new(),
            heartbeat: 0,
        }
    }

    /// Attach a property to the member, builder style
    pub fn with_property<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// The key this member is indexed under
    pub fn key(&self) -> MemberKey {
        MemberKey { cluster: self.cluster.clone(), node_id: self.node_id.clone() }
    }

    /// The member's datacenter tag, if set
    pub fn datacenter(&self) -> Option<&str> {
        self.properties.get(DATACENTER_PROPERTY).map(String::as_str)
    }

    /// The member's rack tag, if set
    pub fn rack(&self) -> Option<&str> {
        self.properties.get(RACK_PROPERTY).map(String::as_str)
    }
}

/// The state a peer holds in the membership table
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PeerState {
    /// The peer is considered alive
    Up,
    /// The peer is considered failed or not yet observed
    Down,
}

impl Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerState::Up => write!(f, "UP"),
            PeerState::Down => write!(f, "DOWN"),
        }
    }
}

// ----------------
// | Local member |
// ----------------

/// The locally running member
///
/// Unlike remote members, the local heartbeat counter is advanced by this
/// node before every outbound push, so it lives behind an atomic that the
/// gossiper's worker threads may bump without locking
#[derive(Debug)]
pub struct LocalMember {
    /// The static identity of the local member
    member: Member,
    /// The current heartbeat counter
    heartbeat: AtomicU64,
}

impl LocalMember {
    /// Constructor
    pub fn new(member: Member) -> Self {
        let heartbeat = AtomicU64::new(member.heartbeat);
        Self { member, heartbeat }
    }

    /// The local member's node ID
    pub fn node_id(&self) -> &NodeId {
        &self.member.node_id
    }

    /// The local member's cluster name
    pub fn cluster(&self) -> &str {
        &self.member.cluster
    }

    /// The local member's key in the membership ordering
    pub fn key(&self) -> MemberKey {
        self.member.key()
    }

    /// The local member's datacenter tag, if set
    pub fn datacenter(&self) -> Option<&str> {
        self.member.datacenter()
    }

    /// The local member's rack tag, if set
    pub fn rack(&self) -> Option<&str> {
        self.member.rack()
    }

    /// Advance the heartbeat counter to the given monotonic reading
    ///
    /// The counter never moves backwards, even if callers race
    pub fn advance_heartbeat(&self, now_ns: u64) -> u64 {
        self.heartbeat.fetch_max(now_ns, Ordering::Relaxed);
        self.heartbeat.load(Ordering::Relaxed)
    }

    /// Snapshot the member with its current heartbeat counter
    pub fn snapshot(&self) -> Member {
        let mut member = self.member.clone();
        member.heartbeat = self.heartbeat.load(Ordering::Relaxed);
        member
    }
}
