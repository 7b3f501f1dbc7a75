//! Configuration for the gossip engine
//!
//! Everything the engine constructor needs: the local identity, the seed
//! list, failure-detector tuning, gossip tier intervals, and the names of
//! the protocol codec and transport to resolve from their registries.
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]

use std::collections::BTreeMap;

use common::types::{
    member::{Endpoint, Member},
    NodeId,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

// -------------
// | Constants |
// -------------

/// The default same-rack gossip interval in milliseconds
pub const DEFAULT_SAME_RACK_INTERVAL_MS: u64 = 100;
/// The default same-datacenter, different-rack gossip interval in ms
pub const DEFAULT_SAME_DC_INTERVAL_MS: u64 = 500;
/// The default cross-datacenter gossip interval in milliseconds
pub const DEFAULT_REMOTE_INTERVAL_MS: u64 = 1_000;
/// The default dead-peer ping interval in milliseconds
pub const DEFAULT_DEAD_INTERVAL_MS: u64 = 250;
/// The default membership refresh interval in milliseconds
pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 1_000;
/// The default failure-detector window size
pub const DEFAULT_WINDOW_SIZE: usize = 100;
/// The default minimum sample count before the detector may convict
pub const DEFAULT_MINIMUM_SAMPLES: usize = 5;
/// The default phi conviction threshold
pub const DEFAULT_CONVICTION_THRESHOLD: f64 = 8.0;
/// The default interval between persistence snapshots in milliseconds
pub const DEFAULT_PERSIST_INTERVAL_MS: u64 = 60_000;

/// The property overriding the same-rack gossip interval
pub const SAME_RACK_INTERVAL_PROPERTY: &str = "same_rack_interval_ms";
/// The property overriding the same-datacenter gossip interval
pub const SAME_DC_INTERVAL_PROPERTY: &str = "same_dc_interval_ms";
/// The property overriding the cross-datacenter gossip interval
pub const REMOTE_INTERVAL_PROPERTY: &str = "remote_interval_ms";
/// The property overriding the dead-peer ping interval
pub const DEAD_INTERVAL_PROPERTY: &str = "dead_interval_ms";

// -------------
// | Intervals |
// -------------

/// The periods of the topology-tiered gossip tasks
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct GossipIntervals {
    /// The period of pushes to same-rack peers
    pub same_rack_ms: u64,
    /// The period of pushes to same-datacenter, different-rack peers
    pub same_dc_ms: u64,
    /// The period of pushes to peers in other datacenters
    pub remote_ms: u64,
    /// The period of membership pings to DOWN peers
    pub dead_ms: u64,
}

impl Default for GossipIntervals {
    fn default() -> Self {
        Self {
            same_rack_ms: DEFAULT_SAME_RACK_INTERVAL_MS,
            same_dc_ms: DEFAULT_SAME_DC_INTERVAL_MS,
            remote_ms: DEFAULT_REMOTE_INTERVAL_MS,
            dead_ms: DEFAULT_DEAD_INTERVAL_MS,
        }
    }
}

impl GossipIntervals {
    /// Apply per-property overrides on top of the defaults
    ///
    /// An unparsable override is logged and the default is kept; a tag typo
    /// should not keep a node from starting
    pub fn with_overrides(properties: &BTreeMap<String, String>) -> Self {
        Self::default().overridden(properties)
    }

    /// Apply per-property overrides on top of these intervals
    pub fn overridden(self, properties: &BTreeMap<String, String>) -> Self {
        Self {
            same_rack_ms: parse_interval_property(
                properties,
                SAME_RACK_INTERVAL_PROPERTY,
                self.same_rack_ms,
            ),
            same_dc_ms: parse_interval_property(
                properties,
                SAME_DC_INTERVAL_PROPERTY,
                self.same_dc_ms,
            ),
            remote_ms: parse_interval_property(
                properties,
                REMOTE_INTERVAL_PROPERTY,
                self.remote_ms,
            ),
            dead_ms: parse_interval_property(properties, DEAD_INTERVAL_PROPERTY, self.dead_ms),
        }
    }
}

/// Parse one interval override, falling back to the default on a bad value
fn parse_interval_property(
    properties: &BTreeMap<String, String>,
    property: &str,
    default: u64,
) -> u64 {
    match properties.get(property) {
        None => default,
        Some(raw) => match raw.parse::<u64>() {
            Ok(parsed) if parsed > 0 => parsed,
            _ => {
                warn!("ignoring unparsable {property} override {raw:?}, using {default}ms");
                default
            },
        },
    }
}

// --------------------
// | Failure detector |
// --------------------

/// The inter-arrival distribution the failure detector assumes
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Distribution {
    /// Gaussian inter-arrival times
    Normal,
    /// Exponential inter-arrival times
    Exponential,
}

/// Tuning for the phi accrual failure detector
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailureDetectorConfig {
    /// The number of inter-arrival samples kept per peer
    pub window_size: usize,
    /// The sample count below which phi is reported as zero
    pub minimum_samples: usize,
    /// The assumed inter-arrival distribution
    pub distribution: Distribution,
    /// The phi value at and above which a peer is convicted DOWN
    pub conviction_threshold: f64,
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            minimum_samples: DEFAULT_MINIMUM_SAMPLES,
            distribution: Distribution::Normal,
            conviction_threshold: DEFAULT_CONVICTION_THRESHOLD,
        }
    }
}

// ----------
// | Config |
// ----------

/// The full configuration of a gossip engine instance
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GossipConfig {
    /// The name of the cluster the local node joins
    pub cluster: String,
    /// The local node's ID
    pub node_id: NodeId,
    /// The endpoint the local node advertises
    pub endpoint: Endpoint,
    /// Free-form properties attached to the local member; the reserved
    /// `datacenter` / `rack` tags select topology tiers, and interval
    /// override properties are read from here as well
    pub properties: BTreeMap<String, String>,
    /// The members seeded into the table (as DOWN) at startup
    pub seeds: Vec<Member>,
    /// Failure detector tuning
    pub failure_detector: FailureDetectorConfig,
    /// The gossip tier intervals, after property overrides
    pub intervals: GossipIntervals,
    /// The membership refresh period in milliseconds
    pub refresh_interval_ms: u64,
    /// The expired-data sweep period in milliseconds; defaults to the
    /// same-datacenter data gossip period
    pub reaper_interval_ms: u64,
    /// The period between persistence snapshots in milliseconds
    pub persist_interval_ms: u64,
    /// The registered name of the protocol codec to use
    pub codec: String,
    /// The registered name of the transport to use
    pub transport: String,
    /// The active gossiper variant: `topology` rates pushes by datacenter
    /// and rack tags, `uniform` treats all live peers alike
    pub gossiper: String,
}

impl GossipConfig {
    /// Build a config for the given local identity with defaulted tuning
    pub fn new<C: Into<String>>(cluster: C, node_id: NodeId, endpoint: Endpoint) -> Self {
        Self {
            cluster: cluster.into(),
            node_id,
            endpoint,
            properties: BTreeMap::new(),
            seeds: Vec::new(),
            failure_detector: FailureDetectorConfig::default(),
            intervals: GossipIntervals::default(),
            refresh_interval_ms: DEFAULT_REFRESH_INTERVAL_MS,
            reaper_interval_ms: DEFAULT_SAME_DC_INTERVAL_MS,
            persist_interval_ms: DEFAULT_PERSIST_INTERVAL_MS,
            codec: "bincode".to_string(),
            transport: "loopback".to_string(),
            gossiper: "topology".to_string(),
        }
    }

    /// Select the active gossiper variant, builder style
    pub fn with_gossiper<S: Into<String>>(mut self, gossiper: S) -> Self {
        self.gossiper = gossiper.into();
        self
    }

    /// Attach a property to the local member, builder style
    ///
    /// Re-applies interval overrides so that tag-carried tuning is honored
    pub fn with_property<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.properties.insert(key.into(), value.into());
        self.intervals = self.intervals.overridden(&self.properties);
        self
    }

    /// Add a seed member, builder style
    pub fn with_seed(mut self, seed: Member) -> Self {
        self.seeds.push(seed);
        self
    }

    /// The local member this config describes, with a zeroed heartbeat
    pub fn local_member(&self) -> Member {
        let mut member = Member::new(self.cluster.clone(), self.node_id.clone(), self.endpoint.clone());
        member.properties = self.properties.clone();
        member
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use super::{GossipIntervals, DEFAULT_SAME_DC_INTERVAL_MS, SAME_RACK_INTERVAL_PROPERTY};

    /// Tests that a well-formed property overrides its tier interval
    #[test]
    fn test_interval_override() {
        let mut properties = BTreeMap::new();
        properties.insert(SAME_RACK_INTERVAL_PROPERTY.to_string(), "50".to_string());

        let intervals = GossipIntervals::with_overrides(&properties);
        assert_eq!(intervals.same_rack_ms, 50);
        assert_eq!(intervals.same_dc_ms, DEFAULT_SAME_DC_INTERVAL_MS);
    }

    /// Tests that unparsable and zero overrides fall back to the default
    #[test]
    fn test_bad_override_defaults() {
        let mut properties = BTreeMap::new();
        properties.insert(SAME_RACK_INTERVAL_PROPERTY.to_string(), "fast".to_string());
        assert_eq!(GossipIntervals::with_overrides(&properties).same_rack_ms, 100);

        properties.insert(SAME_RACK_INTERVAL_PROPERTY.to_string(), "0".to_string());
        assert_eq!(GossipIntervals::with_overrides(&properties).same_rack_ms, 100);
    }
}
