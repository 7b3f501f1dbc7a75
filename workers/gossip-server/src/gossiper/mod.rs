//! Active gossipers: the periodic outbound push side of the protocol
//!
//! The engine holds its gossiper as a capability set behind the
//! `ActiveGossiper` trait; the topology-aware variant layers tiered
//! scheduling over the same push machinery the uniform variant uses.

use std::{sync::Arc, time::Duration};

use common::types::member::{LocalMember, Member};
use config::GossipIntervals;

use crate::errors::GossipError;

pub mod sender;
pub mod topology;
pub mod uniform;

pub use sender::GossipSender;
use topology::TopologyGossiper;
use uniform::UniformGossiper;

/// The registered name of the uniform gossiper
pub const UNIFORM_GOSSIPER: &str = "uniform";
/// The registered name of the topology-aware gossiper
pub const TOPOLOGY_GOSSIPER: &str = "topology";

/// The periodic push capability the engine drives
pub trait ActiveGossiper: Send {
    /// Begin the gossiper's repeating push tasks
    fn start(&mut self) -> Result<(), GossipError>;

    /// Stop the push tasks; pending pool work is unaffected
    fn shutdown(&mut self);

    /// Push a membership list once, outside the periodic schedule
    fn send_membership_list(&self);

    /// Push per-node data once, outside the periodic schedule
    fn send_per_node_data(&self);

    /// Push shared data once, outside the periodic schedule
    fn send_shared_data(&self);
}

/// Resolve a gossiper variant from its configured name
pub fn resolve_gossiper(
    name: &str,
    sender: Arc<GossipSender>,
    intervals: GossipIntervals,
) -> Result<Box<dyn ActiveGossiper>, GossipError> {
    match name {
        UNIFORM_GOSSIPER => Ok(Box::new(UniformGossiper::new(sender, intervals))),
        TOPOLOGY_GOSSIPER => Ok(Box::new(TopologyGossiper::new(sender, intervals))),
        _ => Err(GossipError::Setup(format!("unknown gossiper: {name}"))),
    }
}

// ---------
// | Tiers |
// ---------

/// A topology tier relative to the local member's tags
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Tier {
    /// Peers sharing both the local datacenter and rack
    SameRack,
    /// Peers in the local datacenter on a different rack
    SameDc,
    /// Peers in other datacenters
    Remote,
}

/// All tiers, in increasing push-period order
pub const ALL_TIERS: [Tier; 3] = [Tier::SameRack, Tier::SameDc, Tier::Remote];

impl Tier {
    /// A short label used in thread names and logs
    pub fn label(&self) -> &'static str {
        match self {
            Tier::SameRack => "rack",
            Tier::SameDc => "dc",
            Tier::Remote => "remote",
        }
    }

    /// The push period of this tier under the given intervals
    pub fn period(&self, intervals: &GossipIntervals) -> Duration {
        let millis = match self {
            Tier::SameRack => intervals.same_rack_ms,
            Tier::SameDc => intervals.same_dc_ms,
            Tier::Remote => intervals.remote_ms,
        };
        Duration::from_millis(millis)
    }
}

/// The live members falling in a tier relative to the local member
///
/// Computed fresh from a live snapshot on every tick. A local member missing
/// either tag yields an empty set for every tier, making the tiered tasks
/// no-ops; untagged peers are likewise never tier candidates.
pub fn tier_candidates(local: &LocalMember, live: &[Member], tier: Tier) -> Vec<Member> {
    let (dc, rack) = match (local.datacenter(), local.rack()) {
        (Some(dc), Some(rack)) => (dc, rack),
        _ => return Vec::new(),
    };

    live.iter()
        .filter(|member| {
            let member_dc = member.datacenter();
            let member_rack = member.rack();
            match tier {
                Tier::SameRack => member_dc == Some(dc) && member_rack == Some(rack),
                Tier::SameDc => {
                    member_dc == Some(dc)
                        && member_rack.map(|peer_rack| peer_rack != rack).unwrap_or(false)
                },
                Tier::Remote => member_dc.map(|peer_dc| peer_dc != dc).unwrap_or(false),
            }
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod test {
    use common::types::{
        member::{Endpoint, LocalMember, Member},
        NodeId,
    };

    use super::{tier_candidates, Tier};

    /// Builds a member tagged with the given datacenter and rack
    fn tagged(id: &str, dc: &str, rack: &str) -> Member {
        Member::new("cluster", NodeId::from(id), Endpoint::new("udp", "10.0.0.1", 9000))
            .with_property("datacenter", dc)
            .with_property("rack", rack)
    }

    /// Tests that each tier admits exactly its own peers
    #[test]
    fn test_tier_filtering() {
        let local = LocalMember::new(tagged("local", "dc1", "r1"));
        let live = vec![
            tagged("same-rack", "dc1", "r1"),
            tagged("same-dc", "dc1", "r2"),
            tagged("other-dc-same-rack-name", "dc2", "r1"),
            tagged("other-dc", "dc2", "r9"),
        ];

        let ids = |tier| {
            tier_candidates(&local, &live, tier)
                .into_iter()
                .map(|m| m.node_id.to_string())
                .collect::<Vec<_>>()
        };

        assert_eq!(ids(Tier::SameRack), vec!["same-rack"]);
        assert_eq!(ids(Tier::SameDc), vec!["same-dc"]);
        assert_eq!(ids(Tier::Remote), vec!["other-dc-same-rack-name", "other-dc"]);
    }

    /// Tests that a local member missing tags yields empty tiers
    #[test]
    fn test_untagged_local_is_empty() {
        let local = LocalMember::new(Member::new(
            "cluster",
            NodeId::from("local"),
            Endpoint::new("udp", "10.0.0.1", 9000),
        ));
        let live = vec![tagged("n1", "dc1", "r1")];

        for tier in [Tier::SameRack, Tier::SameDc, Tier::Remote] {
            assert!(tier_candidates(&local, &live, tier).is_empty());
        }
    }

    /// Tests that untagged peers never land in a tier
    #[test]
    fn test_untagged_peer_excluded() {
        let local = LocalMember::new(tagged("local", "dc1", "r1"));
        let live = vec![Member::new(
            "cluster",
            NodeId::from("bare"),
            Endpoint::new("udp", "10.0.0.2", 9000),
        )];

        for tier in [Tier::SameRack, Tier::SameDc, Tier::Remote] {
            assert!(tier_candidates(&local, &live, tier).is_empty());
        }
    }
}
