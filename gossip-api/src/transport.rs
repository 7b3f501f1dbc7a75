//! The transport seam the engine hands outbound frames to
//!
//! The transport owns all I/O. The engine gives it a sink for inbound frames
//! at construction and only ever calls `start_endpoint`, `send`, and
//! `shutdown` afterwards.

use std::{collections::HashMap, sync::Arc};

use common::types::member::Endpoint;

use crate::errors::WireError;

/// The callback a transport delivers inbound frames to
pub type InboundSink = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// A factory constructing a transport bound to a local endpoint and sink
pub type TransportFactory =
    Arc<dyn Fn(Endpoint, InboundSink) -> Result<Box<dyn Transport>, WireError> + Send + Sync>;

/// Moves frames between gossip endpoints
pub trait Transport: Send + Sync {
    /// Begin accepting inbound frames on the local endpoint
    fn start_endpoint(&self) -> Result<(), WireError>;

    /// Send a frame to a peer endpoint
    ///
    /// Delivery is best-effort; a dropped frame only slows convergence
    fn send(&self, endpoint: &Endpoint, frame: &[u8]) -> Result<(), WireError>;

    /// Stop accepting inbound frames and release the endpoint
    fn shutdown(&self) -> Result<(), WireError>;
}

/// A name → factory registry of transports
///
/// The engine resolves its transport from a configuration string; tests
/// register the loopback network here
#[derive(Clone, Default)]
pub struct TransportRegistry {
    /// The registered factories
    factories: HashMap<String, TransportFactory>,
}

impl TransportRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under a name, replacing any previous entry
    pub fn register<S: Into<String>>(&mut self, name: S, factory: TransportFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Construct the named transport bound to the given endpoint and sink
    pub fn resolve(
        &self,
        name: &str,
        endpoint: Endpoint,
        sink: InboundSink,
    ) -> Result<Box<dyn Transport>, WireError> {
        let factory =
            self.factories.get(name).ok_or_else(|| WireError::UnknownTransport(name.to_string()))?;
        factory(endpoint, sink)
    }
}
