//! Persistence snapshot types and the persister seam
//!
//! The engine does not own a serializer or any on-disk format; it hands a
//! snapshot to the configured `Persister` on a fixed cadence and applies a
//! loaded snapshot at startup.

use common::types::{
    datum::{PerNodeDatum, SharedDatum},
    member::Member,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::GossipState;

/// An error saving or loading a snapshot
#[derive(Clone, Debug, Error)]
#[error("persistence failed: {0}")]
pub struct PersistError(pub String);

/// Saves and loads engine snapshots
pub trait Persister: Send + Sync {
    /// Persist a snapshot
    fn save(&self, snapshot: &EngineSnapshot) -> Result<(), PersistError>;

    /// Load the most recent snapshot; `None` on a cold start
    fn load(&self) -> Result<Option<EngineSnapshot>, PersistError>;
}

/// A point-in-time copy of the replicated state worth carrying across
/// restarts: the membership ring and both data maps
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineSnapshot {
    /// Every known member with its last observed heartbeat
    pub members: Vec<Member>,
    /// All unexpired per-node data
    pub per_node: Vec<PerNodeDatum>,
    /// All unexpired shared data
    pub shared: Vec<SharedDatum>,
}

impl EngineSnapshot {
    /// Capture a snapshot of the given state
    pub fn capture(state: &GossipState) -> Self {
        Self {
            members: state.membership().snapshot_all().into_iter().map(|(member, _)| member).collect(),
            per_node: state.store().per_node_snapshot(),
            shared: state.store().shared_snapshot(),
        }
    }

    /// Apply a loaded snapshot onto fresh state
    ///
    /// Members come back DOWN with their saved heartbeats; liveness is
    /// re-proven by the failure detector, not by history
    pub fn apply_to(&self, state: &GossipState) {
        for member in &self.members {
            state.membership().seed(member.clone());
        }
        for datum in &self.per_node {
            state.store().add_per_node(datum.clone());
        }
        for datum in &self.shared {
            state.store().add_shared(datum.clone());
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use common::{
        clock::mocks::MockClock,
        types::{
            datum::{GossipPayload, SharedDatum},
            member::{Endpoint, Member, PeerState},
            NodeId,
        },
    };
    use config::FailureDetectorConfig;

    use crate::GossipState;

    use super::EngineSnapshot;

    /// Builds fresh state for the given local node id
    fn state(id: &str) -> GossipState {
        let local = Member::new("cluster", NodeId::from(id), Endpoint::new("udp", "10.0.0.1", 9000));
        GossipState::new(local, FailureDetectorConfig::default(), Arc::new(MockClock::new()))
    }

    /// Tests that a captured snapshot re-seeds a fresh node's state with
    /// members restored as DOWN
    #[test]
    fn test_capture_then_apply() {
        let original = state("local");

        let mut peer =
            Member::new("cluster", NodeId::from("peer"), Endpoint::new("udp", "10.0.0.2", 9000));
        peer.heartbeat = 7;
        original.membership().upsert_from_heartbeat(peer.clone(), 0);
        original.membership().set_state(&peer.key(), PeerState::Up);

        original.store().add_shared(SharedDatum {
            key: "k".to_string(),
            node_id: NodeId::from("peer"),
            timestamp: 100,
            expire_at: None,
            payload: GossipPayload::Bytes(vec![1]),
        });

        let snapshot = EngineSnapshot::capture(&original);
        let restored = state("local");
        snapshot.apply_to(&restored);

        assert_eq!(restored.membership().heartbeat_of(&peer.key()), Some(7));
        assert_eq!(restored.membership().state_of(&peer.key()), Some(PeerState::Down));
        assert!(restored.store().find_shared("k").is_some());
    }
}

pub mod mocks {
    //! An in-memory persister for tests

    use std::sync::Mutex;

    use super::{EngineSnapshot, PersistError, Persister};

    /// Holds the last saved snapshot in memory
    #[derive(Default)]
    pub struct MemoryPersister {
        /// The last saved snapshot
        snapshot: Mutex<Option<EngineSnapshot>>,
        /// The number of saves performed
        saves: Mutex<usize>,
    }

    impl MemoryPersister {
        /// Constructor
        pub fn new() -> Self {
            Self::default()
        }

        /// The number of saves performed so far
        pub fn save_count(&self) -> usize {
            *self.saves.lock().expect("saves lock poisoned")
        }
    }

    impl Persister for MemoryPersister {
        fn save(&self, snapshot: &EngineSnapshot) -> Result<(), PersistError> {
            *self.snapshot.lock().expect("snapshot lock poisoned") = Some(snapshot.clone());
            *self.saves.lock().expect("saves lock poisoned") += 1;
            Ok(())
        }

        fn load(&self) -> Result<Option<EngineSnapshot>, PersistError> {
            Ok(self.snapshot.lock().expect("snapshot lock poisoned").clone())
        }
    }
}
