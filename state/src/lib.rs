//! The node's replicated state: membership, failure detection, and the
//! per-node / shared data maps
//!
//! All components here are passive. Threads that drive them on a cadence
//! (the gossiper, reaper, and refresher) live in the gossip-server crate.
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]

use std::sync::Arc;

use common::{
    clock::Clock,
    types::member::{LocalMember, Member},
};
use config::FailureDetectorConfig;

pub mod failure_detector;
pub mod membership;
pub mod snapshot;
pub mod store;

use failure_detector::FailureDetector;
use membership::MembershipTable;
use store::DataStore;

/// The composed state shared by every worker in the node
pub struct GossipState {
    /// The time source
    clock: Arc<dyn Clock>,
    /// The locally running member
    local: LocalMember,
    /// The phi accrual failure detector
    detector: Arc<FailureDetector>,
    /// The membership table
    membership: MembershipTable,
    /// The data store
    store: DataStore,
}

impl GossipState {
    /// Construct state for the given local member
    pub fn new(
        local: Member,
        detector_config: FailureDetectorConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let detector = Arc::new(FailureDetector::new(detector_config));
        let membership = MembershipTable::new(detector.clone());
        let store = DataStore::new(clock.clone());

        Self { clock, local: LocalMember::new(local), detector, membership, store }
    }

    /// The time source
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The local member
    pub fn local(&self) -> &LocalMember {
        &self.local
    }

    /// The failure detector
    pub fn detector(&self) -> &FailureDetector {
        &self.detector
    }

    /// The membership table
    pub fn membership(&self) -> &MembershipTable {
        &self.membership
    }

    /// The data store
    pub fn store(&self) -> &DataStore {
        &self.store
    }
}
