//! Per-node and shared gossip payload types

use serde::{Deserialize, Serialize};

use super::{crdt::Crdt, NodeId};

/// An opaque or CRDT payload carried by a gossip datum
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum GossipPayload {
    /// Raw application bytes, replicated last-writer-wins
    Bytes(Vec<u8>),
    /// A CRDT, replicated by merge
    Crdt(Crdt),
}

impl GossipPayload {
    /// The payload as a CRDT, if it is one
    pub fn as_crdt(&self) -> Option<&Crdt> {
        match self {
            GossipPayload::Crdt(crdt) => Some(crdt),
            GossipPayload::Bytes(_) => None,
        }
    }

    /// A stable fingerprint of the payload, used to break timestamp ties
    ///
    /// Two equal payloads always fingerprint equally; distinct payloads are
    /// ordered lexicographically on the hex of their canonical encoding
    pub fn fingerprint(&self) -> String {
        let bytes = bincode::serialize(self).expect("payload serialization failed");
        bytes.iter().map(|byte| format!("{byte:02x}")).collect()
    }
}

/// A key-value payload scoped to the node that produced it
///
/// Uniquely identified by (node id, key)
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PerNodeDatum {
    /// The node the datum belongs to
    pub node_id: NodeId,
    /// The datum's key within the node's namespace
    pub key: String,
    /// The producer's wall-clock timestamp in unix milliseconds
    pub timestamp: i64,
    /// The wall-clock time the datum expires at; `None` never expires
    pub expire_at: Option<i64>,
    /// The payload
    pub payload: GossipPayload,
}

impl PerNodeDatum {
    /// Whether the datum has expired as of the given wall reading
    pub fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expire_at, Some(deadline) if deadline <= now_ms)
    }
}

/// A key-value payload whose key space is shared across the cluster
///
/// Uniquely identified by key alone; any node may own or overwrite it, and
/// CRDT payloads are merged rather than replaced
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SharedDatum {
    /// The shared key
    pub key: String,
    /// The node that originated this version of the datum
    pub node_id: NodeId,
    /// The producer's wall-clock timestamp in unix milliseconds
    pub timestamp: i64,
    /// The wall-clock time the datum expires at; `None` never expires
    pub expire_at: Option<i64>,
    /// The payload
    pub payload: GossipPayload,
}

impl SharedDatum {
    /// Whether the datum has expired as of the given wall reading
    pub fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expire_at, Some(deadline) if deadline <= now_ms)
    }
}
