//! An in-process loopback network used by integration tests
//!
//! Frames move synchronously between registered endpoints over shared
//! memory; individual directed links may be cut to simulate partitions.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use common::types::member::Endpoint;
use tracing::debug;

use crate::{
    errors::WireError,
    transport::{InboundSink, Transport, TransportFactory, TransportRegistry},
};

/// The registered name of the loopback transport
pub const LOOPBACK_TRANSPORT: &str = "loopback";

/// A shared in-process network of loopback endpoints
#[derive(Default)]
pub struct LoopbackNetwork {
    /// The sink registered for each started endpoint
    endpoints: Mutex<HashMap<Endpoint, InboundSink>>,
    /// Directed (from, to) links currently dropping all frames
    cut_links: Mutex<HashSet<(Endpoint, Endpoint)>>,
}

impl LoopbackNetwork {
    /// Constructor
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A registry with this network's transport registered under
    /// `LOOPBACK_TRANSPORT`
    pub fn registry(self: &Arc<Self>) -> TransportRegistry {
        let mut registry = TransportRegistry::new();
        registry.register(LOOPBACK_TRANSPORT, self.factory());
        registry
    }

    /// A factory building transports attached to this network
    pub fn factory(self: &Arc<Self>) -> TransportFactory {
        let network = self.clone();
        Arc::new(move |endpoint, sink| {
            Ok(Box::new(LoopbackTransport { network: network.clone(), local: endpoint, sink })
                as Box<dyn Transport>)
        })
    }

    /// Drop all frames sent from `from` to `to` until the link is restored
    pub fn cut_link(&self, from: &Endpoint, to: &Endpoint) {
        self.cut_links.lock().expect("cut links lock poisoned").insert((from.clone(), to.clone()));
    }

    /// Restore a previously cut link
    pub fn restore_link(&self, from: &Endpoint, to: &Endpoint) {
        self.cut_links.lock().expect("cut links lock poisoned").remove(&(from.clone(), to.clone()));
    }

    /// Deliver a frame from one endpoint to another
    fn deliver(&self, from: &Endpoint, to: &Endpoint, frame: &[u8]) {
        let cut = self
            .cut_links
            .lock()
            .expect("cut links lock poisoned")
            .contains(&(from.clone(), to.clone()));
        if cut {
            debug!("dropping frame on cut link {from} -> {to}");
            return;
        }

        // An unknown destination behaves like a lost datagram
        let sink = self.endpoints.lock().expect("endpoints lock poisoned").get(to).cloned();
        if let Some(sink) = sink {
            sink(frame.to_vec());
        }
    }
}

/// One endpoint's handle onto the loopback network
pub struct LoopbackTransport {
    /// The shared network
    network: Arc<LoopbackNetwork>,
    /// The local endpoint frames are sent from
    local: Endpoint,
    /// The sink inbound frames are delivered to once started
    sink: InboundSink,
}

impl Transport for LoopbackTransport {
    fn start_endpoint(&self) -> Result<(), WireError> {
        self.network
            .endpoints
            .lock()
            .expect("endpoints lock poisoned")
            .insert(self.local.clone(), self.sink.clone());
        Ok(())
    }

    fn send(&self, endpoint: &Endpoint, frame: &[u8]) -> Result<(), WireError> {
        self.network.deliver(&self.local, endpoint, frame);
        Ok(())
    }

    fn shutdown(&self) -> Result<(), WireError> {
        self.network.endpoints.lock().expect("endpoints lock poisoned").remove(&self.local);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use common::types::member::Endpoint;

    use crate::transport::Transport;

    use super::LoopbackNetwork;

    /// Tests frame delivery between two started endpoints
    #[test]
    fn test_delivery() {
        let network = LoopbackNetwork::new();
        let a = Endpoint::new("udp", "10.0.0.1", 9000);
        let b = Endpoint::new("udp", "10.0.0.2", 9000);

        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();

        let factory = network.factory();
        let transport_a = factory(a.clone(), Arc::new(|_| {})).unwrap();
        let transport_b = factory(
            b.clone(),
            Arc::new(move |frame: Vec<u8>| {
                assert_eq!(frame, vec![1, 2, 3]);
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        transport_a.start_endpoint().unwrap();
        transport_b.start_endpoint().unwrap();

        transport_a.send(&b, &[1, 2, 3]).unwrap();
        assert_eq!(received.load(Ordering::SeqCst), 1);

        // Frames to a stopped endpoint vanish like lost datagrams
        transport_b.shutdown().unwrap();
        transport_a.send(&b, &[1, 2, 3]).unwrap();
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    /// Tests that a cut link drops frames in one direction only
    #[test]
    fn test_cut_link() {
        let network = LoopbackNetwork::new();
        let a = Endpoint::new("udp", "10.0.0.1", 9000);
        let b = Endpoint::new("udp", "10.0.0.2", 9000);

        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();

        let factory = network.factory();
        let transport_a = factory(a.clone(), Arc::new(|_| {})).unwrap();
        let transport_b = factory(
            b.clone(),
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        transport_a.start_endpoint().unwrap();
        transport_b.start_endpoint().unwrap();

        network.cut_link(&a, &b);
        transport_a.send(&b, &[0]).unwrap();
        assert_eq!(received.load(Ordering::SeqCst), 0);

        network.restore_link(&a, &b);
        transport_a.send(&b, &[0]).unwrap();
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }
}
