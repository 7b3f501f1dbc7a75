//! Implements the `Worker` trait for the gossip engine

use std::thread::JoinHandle;

use common::worker::Worker;

use crate::{
    engine::{GossipEngine, GossipEngineConfig},
    errors::GossipError,
};

impl Worker for GossipEngine {
    type WorkerConfig = GossipEngineConfig;
    type Error = GossipError;

    fn new(config: Self::WorkerConfig) -> Result<Self, Self::Error> {
        GossipEngine::new(config)
    }

    fn name(&self) -> String {
        format!("gossip-engine-{}", self.self_member().node_id)
    }

    fn is_recoverable(&self) -> bool {
        // The engine can be rebuilt from its config; replicated state is
        // re-learned from peers or the persister
        true
    }

    fn start(&mut self) -> Result<(), Self::Error> {
        GossipEngine::start(self)
    }

    fn join(&mut self) -> Vec<JoinHandle<Self::Error>> {
        // Scheduled tasks are joined inside shutdown; nothing is left to
        // hand the coordinator once the engine stops
        Vec::new()
    }

    fn cleanup(&mut self) -> Result<(), Self::Error> {
        self.shutdown()
    }
}
