//! The gossip engine: composition root, lifecycle, and the public API
//!
//! The engine wires the codec, transport, gossiper, reaper, refresher, and
//! persistence cadence together, guards the API behind a running flag, and
//! tears everything down with bounded grace periods. Shutdown is idempotent.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use common::{
    clock::{Clock, SystemClock},
    types::{
        crdt::Crdt,
        datum::{PerNodeDatum, SharedDatum},
        member::Member,
        new_cancel_channel, CancelChannel, CancelSender, NodeId,
    },
};
use config::GossipConfig;
use gossip_api::{
    codec::{resolve_codec, ProtocolCodec},
    transport::{Transport, TransportRegistry},
};
use state::{
    membership::GossipListener,
    snapshot::{EngineSnapshot, Persister},
    store::{PerNodeDataSubscriber, SharedDataSubscriber},
    GossipState,
};
use tracing::{info, warn};

use crate::{
    dispatcher::MessageDispatcher,
    errors::GossipError,
    gossiper::{resolve_gossiper, ActiveGossiper, GossipSender},
    pool::{WorkerPool, POOL_CAPACITY, POOL_WORKERS},
    reaper::start_reaper,
    refresher::start_refresher,
    timers::RepeatingTimer,
};

// -------------
// | Constants |
// -------------

/// How long the worker pool may drain queued pushes at shutdown
const POOL_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// How long scheduled tasks may take to observe cancellation at shutdown
const TIMER_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Emitted when a datum carries an empty key
const ERR_EMPTY_KEY: &str = "datum key must be non-empty";
/// Emitted when a datum carries a non-positive timestamp
const ERR_BAD_TIMESTAMP: &str = "datum timestamp must be positive";
/// Emitted when a CRDT operation is handed a non-CRDT payload
const ERR_NOT_CRDT: &str = "payload is not a CRDT";

// -----------------
// | Collaborators |
// -----------------

/// A collaborator coordinating distributed locks over shared data
///
/// The voting protocol itself lives outside the engine; the engine only
/// stops it at shutdown, and its refusals surface as `VoteFailed`
pub trait LockManager: Send + Sync {
    /// Stop the lock manager's background activity
    fn shutdown(&self);
}

/// The configuration handed to the engine constructor
pub struct GossipEngineConfig {
    /// The engine's settings
    pub config: GossipConfig,
    /// The time source; defaults to the system clock
    pub clock: Option<Arc<dyn Clock>>,
    /// The transport registry the configured transport is resolved from
    pub transports: TransportRegistry,
    /// The persister snapshots are saved to, if any
    pub persister: Option<Arc<dyn Persister>>,
    /// The lock manager to stop at shutdown, if any
    pub lock_manager: Option<Arc<dyn LockManager>>,
}

impl GossipEngineConfig {
    /// A config with no optional collaborators
    pub fn new(config: GossipConfig, transports: TransportRegistry) -> Self {
        Self { config, clock: None, transports, persister: None, lock_manager: None }
    }
}

// ----------
// | Engine |
// ----------

/// The gossip engine
pub struct GossipEngine {
    /// The engine's settings
    config: GossipConfig,
    /// The composed node state
    state: Arc<GossipState>,
    /// The inbound message router
    dispatcher: Arc<MessageDispatcher>,
    /// The resolved protocol codec
    codec: Arc<dyn ProtocolCodec>,
    /// The resolved transport
    transport: Arc<dyn Transport>,
    /// The persister, if configured
    persister: Option<Arc<dyn Persister>>,
    /// The lock manager, if configured
    lock_manager: Option<Arc<dyn LockManager>>,
    /// Whether the engine is between start and shutdown
    running: Arc<AtomicBool>,
    /// The push worker pool, alive while running
    pool: Option<Arc<WorkerPool>>,
    /// The push machinery, alive while running
    sender: Option<Arc<GossipSender>>,
    /// The active gossiper, alive while running
    gossiper: Option<Box<dyn ActiveGossiper>>,
    /// The cancel sender for scheduled tasks; dropped to stop them
    cancel: Option<CancelSender>,
    /// The reaper, refresher, and persistence timers
    timers: Vec<RepeatingTimer>,
    /// The membership listener fan-out thread
    fanout: Option<JoinHandle<GossipError>>,
}

impl GossipEngine {
    /// Construct the engine, resolving the codec and transport from their
    /// registries; nothing runs until `start`
    pub fn new(engine_config: GossipEngineConfig) -> Result<Self, GossipError> {
        let GossipEngineConfig { config, clock, transports, persister, lock_manager } =
            engine_config;

        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let state = Arc::new(GossipState::new(
            config.local_member(),
            config.failure_detector,
            clock,
        ));
        let dispatcher = Arc::new(MessageDispatcher::new(state.clone()));
        let codec = resolve_codec(&config.codec)?;
        let running = Arc::new(AtomicBool::new(false));

        // Inbound frames decode and dispatch on the transport's thread;
        // frames arriving outside the running window are dropped
        let sink = {
            let dispatcher = dispatcher.clone();
            let codec = codec.clone();
            let running = running.clone();
            Arc::new(move |frame: Vec<u8>| {
                if !running.load(Ordering::SeqCst) {
                    return;
                }
                match codec.decode(&frame) {
                    Ok(message) => dispatcher.dispatch(message),
                    Err(err) => warn!("dropping undecodable frame: {err}"),
                }
            })
        };
        let transport: Arc<dyn Transport> =
            Arc::from(transports.resolve(&config.transport, config.endpoint.clone(), sink)?);

        Ok(Self {
            config,
            state,
            dispatcher,
            codec,
            transport,
            persister,
            lock_manager,
            running,
            pool: None,
            sender: None,
            gossiper: None,
            cancel: None,
            timers: Vec::new(),
            fanout: None,
        })
    }

    // -------------
    // | Lifecycle |
    // -------------

    /// Start the engine; a second call while running is a no-op
    pub fn start(&mut self) -> Result<(), GossipError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let result = self.start_components();
        if result.is_err() {
            self.running.store(false, Ordering::SeqCst);
            self.stop_components(false /* announce */);
        }
        result
    }

    /// Stop the engine; safe to call any number of times
    pub fn shutdown(&mut self) -> Result<(), GossipError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        info!("stopping gossip engine for {}", self.state.local().node_id());
        self.stop_components(true /* announce */);
        Ok(())
    }

    /// Alias for `shutdown`
    pub fn stop(&mut self) -> Result<(), GossipError> {
        self.shutdown()
    }

    /// Bring up every component in dependency order
    fn start_components(&mut self) -> Result<(), GossipError> {
        info!("starting gossip engine for {}", self.state.local().node_id());

        // Restore persisted state before anything can observe it
        if let Some(persister) = &self.persister {
            match persister.load() {
                Ok(Some(snapshot)) => {
                    info!("restoring {} members from persisted snapshot", snapshot.members.len());
                    snapshot.apply_to(&self.state);
                },
                Ok(None) => {},
                Err(err) => warn!("failed to load persisted state: {err}"),
            }
        }

        // Seed configured members as DOWN; the refresher elevates them once
        // they prove themselves to the failure detector
        let local_id = self.state.local().node_id().clone();
        for seed in self.config.seeds.clone() {
            if seed.node_id == local_id {
                continue;
            }
            self.state.membership().seed(seed);
        }

        self.transport.start_endpoint()?;

        let (cancel_tx, cancel_rx) = new_cancel_channel();
        self.fanout = self.spawn_listener_fanout(cancel_rx.clone())?;

        let pool = Arc::new(WorkerPool::new("gossip-push", POOL_CAPACITY, POOL_WORKERS)?);
        let sender = Arc::new(GossipSender::new(
            self.state.clone(),
            self.codec.clone(),
            self.transport.clone(),
            pool.clone(),
        ));
        let mut gossiper =
            resolve_gossiper(&self.config.gossiper, sender.clone(), self.config.intervals)?;
        gossiper.start()?;

        self.timers.push(start_reaper(
            self.state.clone(),
            Duration::from_millis(self.config.reaper_interval_ms),
            cancel_rx.clone(),
        )?);
        self.timers.push(start_refresher(
            self.state.clone(),
            Duration::from_millis(self.config.refresh_interval_ms),
            cancel_rx.clone(),
        )?);

        if let Some(persister) = self.persister.clone() {
            let snapshot_state = self.state.clone();
            self.timers.push(RepeatingTimer::spawn(
                "state-persister",
                Duration::from_millis(self.config.persist_interval_ms),
                cancel_rx,
                move || {
                    let snapshot = EngineSnapshot::capture(&snapshot_state);
                    if let Err(err) = persister.save(&snapshot) {
                        warn!("failed to persist state snapshot: {err}");
                    }
                },
            )?);
        }

        self.pool = Some(pool);
        self.sender = Some(sender);
        self.gossiper = Some(gossiper);
        self.cancel = Some(cancel_tx);
        Ok(())
    }

    /// Tear down components in reverse dependency order
    ///
    /// When `announce` is set, a best-effort shutdown notice goes out to a
    /// third of the live peers before the pool drains
    fn stop_components(&mut self, announce: bool) {
        if let Some(lock_manager) = &self.lock_manager {
            lock_manager.shutdown();
        }

        if let Some(mut gossiper) = self.gossiper.take() {
            gossiper.shutdown();
        }

        if announce {
            if let Some(sender) = &self.sender {
                sender.shutdown_fanout();
            }
        }

        if let Some(pool) = self.pool.take() {
            pool.shutdown(POOL_SHUTDOWN_GRACE);
        }

        if let Err(err) = self.transport.shutdown() {
            warn!("transport shutdown failed: {err}");
        }

        // Dropping the cancel sender wakes every scheduled task
        drop(self.cancel.take());

        let mut handles = Vec::new();
        if let Some(handle) = self.fanout.take() {
            handles.push(handle);
        }
        for mut timer in self.timers.drain(..) {
            if let Some(handle) = timer.join_handle() {
                handles.push(handle);
            }
        }
        join_with_grace(handles, TIMER_SHUTDOWN_GRACE);

        self.sender = None;
    }

    /// Spawn the thread that fans membership events out to listeners
    fn spawn_listener_fanout(
        &self,
        cancel: CancelChannel,
    ) -> Result<Option<JoinHandle<GossipError>>, GossipError> {
        let events = match self.state.membership().take_event_receiver() {
            Some(events) => events,
            None => return Ok(None),
        };

        let state = self.state.clone();
        let handle = thread::Builder::new()
            .name("membership-fanout".to_string())
            .spawn(move || loop {
                crossbeam::select! {
                    recv(cancel) -> _ => {
                        return GossipError::Cancelled("cancel signal received".to_string());
                    },
                    recv(events) -> event => match event {
                        Ok(event) => state.membership().notify_listeners(&event),
                        Err(_) => {
                            return GossipError::Cancelled("event channel closed".to_string());
                        },
                    },
                }
            })
            .map_err(|err| GossipError::Setup(err.to_string()))?;

        Ok(Some(handle))
    }

    // --------------
    // | Gossip API |
    // --------------

    /// Insert a per-node datum for dissemination, stamped with the local
    /// node's ID
    pub fn gossip_per_node_data(&self, mut datum: PerNodeDatum) -> Result<(), GossipError> {
        self.ensure_running()?;
        validate_datum(&datum.key, datum.timestamp)?;

        datum.node_id = self.state.local().node_id().clone();
        self.state.store().add_per_node(datum);
        Ok(())
    }

    /// Insert a shared datum for dissemination, stamped with the local
    /// node's ID as origin
    pub fn gossip_shared_data(&self, mut datum: SharedDatum) -> Result<(), GossipError> {
        self.ensure_running()?;
        validate_datum(&datum.key, datum.timestamp)?;

        datum.node_id = self.state.local().node_id().clone();
        self.state.store().add_shared(datum);
        Ok(())
    }

    /// The CRDT stored under a shared key; `None` if absent, expired, or
    /// not a CRDT
    pub fn find_crdt(&self, key: &str) -> Result<Option<Crdt>, GossipError> {
        self.ensure_running()?;
        Ok(self.state.store().find_shared(key).and_then(|datum| datum.payload.as_crdt().cloned()))
    }

    /// Look up a per-node datum; `None` if absent or expired
    pub fn find_per_node_gossip_data(
        &self,
        node_id: &NodeId,
        key: &str,
    ) -> Result<Option<PerNodeDatum>, GossipError> {
        self.ensure_running()?;
        Ok(self.state.store().find_per_node(node_id, key))
    }

    /// Look up a shared datum; `None` if absent or expired
    pub fn find_shared_gossip_data(&self, key: &str) -> Result<Option<SharedDatum>, GossipError> {
        self.ensure_running()?;
        Ok(self.state.store().find_shared(key))
    }

    /// Merge a CRDT-carrying shared datum into the store, returning the
    /// merged value
    pub fn merge_shared_data(&self, mut datum: SharedDatum) -> Result<Crdt, GossipError> {
        self.ensure_running()?;
        validate_datum(&datum.key, datum.timestamp)?;

        let input = match datum.payload.as_crdt() {
            Some(crdt) => crdt.clone(),
            None => return Err(GossipError::InvalidPayload(ERR_NOT_CRDT.to_string())),
        };

        datum.node_id = self.state.local().node_id().clone();
        let key = datum.key.clone();
        self.state.store().add_shared(datum);

        Ok(self
            .state
            .store()
            .find_shared(&key)
            .and_then(|stored| stored.payload.as_crdt().cloned())
            .unwrap_or(input))
    }

    // --------------
    // | Membership |
    // --------------

    /// The members currently considered alive, in table order
    pub fn live_members(&self) -> Result<Vec<Member>, GossipError> {
        self.ensure_running()?;
        Ok(self.state.membership().snapshot_live())
    }

    /// The members currently considered failed, in table order
    pub fn dead_members(&self) -> Result<Vec<Member>, GossipError> {
        self.ensure_running()?;
        Ok(self.state.membership().snapshot_dead())
    }

    /// The local member with its current heartbeat
    pub fn self_member(&self) -> Member {
        self.state.local().snapshot()
    }

    // -----------------------------
    // | Listeners and subscribers |
    // -----------------------------

    /// Register a membership listener; allowed before start so that no
    /// early event is missed
    pub fn register_gossip_listener(&self, listener: Arc<dyn GossipListener>) -> usize {
        self.state.membership().register_listener(listener)
    }

    /// Unregister a membership listener
    pub fn unregister_gossip_listener(&self, id: usize) {
        self.state.membership().unregister_listener(id);
    }

    /// Register a per-node data subscriber
    pub fn register_per_node_data_subscriber(
        &self,
        subscriber: Arc<dyn PerNodeDataSubscriber>,
    ) -> usize {
        self.state.store().register_per_node_subscriber(subscriber)
    }

    /// Unregister a per-node data subscriber
    pub fn unregister_per_node_data_subscriber(&self, id: usize) {
        self.state.store().unregister_per_node_subscriber(id);
    }

    /// Register a shared data subscriber
    pub fn register_shared_data_subscriber(
        &self,
        subscriber: Arc<dyn SharedDataSubscriber>,
    ) -> usize {
        self.state.store().register_shared_subscriber(subscriber)
    }

    /// Unregister a shared data subscriber
    pub fn unregister_shared_data_subscriber(&self, id: usize) {
        self.state.store().unregister_shared_subscriber(id);
    }

    // -----------
    // | Helpers |
    // -----------

    /// The composed node state; exposed for collaborators and tests
    pub fn state(&self) -> &Arc<GossipState> {
        &self.state
    }

    /// The inbound message router; exposed for transports delivering
    /// pre-decoded messages in tests
    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    /// Error unless the engine is between start and shutdown
    fn ensure_running(&self) -> Result<(), GossipError> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GossipError::NotRunning)
        }
    }
}

impl Drop for GossipEngine {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

// -----------
// | Helpers |
// -----------

/// Validate the caller-supplied fields of a gossip datum
fn validate_datum(key: &str, timestamp: i64) -> Result<(), GossipError> {
    if key.is_empty() {
        return Err(GossipError::InvalidPayload(ERR_EMPTY_KEY.to_string()));
    }
    if timestamp <= 0 {
        return Err(GossipError::InvalidPayload(ERR_BAD_TIMESTAMP.to_string()));
    }
    Ok(())
}

/// Join thread handles, waiting up to `grace` in total; threads that do not
/// stop in time are detached with a warning
fn join_with_grace(handles: Vec<JoinHandle<GossipError>>, grace: Duration) {
    let deadline = Instant::now() + grace;
    for handle in handles {
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        if handle.is_finished() {
            let _ = handle.join();
        } else {
            warn!("scheduled task did not observe cancellation within grace, detaching");
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use common::types::{
        crdt::Crdt,
        datum::{GossipPayload, SharedDatum},
        member::Endpoint,
        NodeId,
    };
    use config::GossipConfig;
    use gossip_api::mocks::LoopbackNetwork;

    use super::{GossipEngine, GossipEngineConfig};
    use crate::errors::GossipError;

    /// Builds an engine on a fresh loopback network
    fn engine(id: &str) -> GossipEngine {
        let network = LoopbackNetwork::new();
        let config = GossipConfig::new(
            "cluster",
            NodeId::from(id),
            Endpoint::new("udp", format!("host-{id}"), 9000),
        );
        GossipEngine::new(GossipEngineConfig::new(config, network.registry())).unwrap()
    }

    /// Builds a shared datum carrying a CRDT set
    fn crdt_datum(key: &str, timestamp: i64, elements: &[&str]) -> SharedDatum {
        SharedDatum {
            key: key.to_string(),
            node_id: NodeId::from("unstamped"),
            timestamp,
            expire_at: None,
            payload: GossipPayload::Crdt(Crdt::set_of(elements.iter().copied())),
        }
    }

    /// Tests that the API is gated on the running flag
    #[test]
    fn test_not_running() {
        let mut engine = engine("n1");
        assert!(matches!(engine.find_crdt("k"), Err(GossipError::NotRunning)));

        engine.start().unwrap();
        assert!(engine.find_crdt("k").unwrap().is_none());

        engine.shutdown().unwrap();
        assert!(matches!(engine.find_crdt("k"), Err(GossipError::NotRunning)));
    }

    /// Tests datum validation on the gossip API
    #[test]
    fn test_invalid_payload() {
        let mut engine = engine("n1");
        engine.start().unwrap();

        let empty_key = crdt_datum("", 100, &["x"]);
        assert!(matches!(
            engine.gossip_shared_data(empty_key),
            Err(GossipError::InvalidPayload(_))
        ));

        let bad_timestamp = crdt_datum("k", 0, &["x"]);
        assert!(matches!(
            engine.gossip_shared_data(bad_timestamp),
            Err(GossipError::InvalidPayload(_))
        ));

        let not_crdt = SharedDatum {
            payload: GossipPayload::Bytes(vec![1]),
            ..crdt_datum("k", 100, &[])
        };
        assert!(matches!(
            engine.merge_shared_data(not_crdt),
            Err(GossipError::InvalidPayload(_))
        ));

        engine.shutdown().unwrap();
    }

    /// Tests that merge returns the merged CRDT and stamps the origin
    #[test]
    fn test_merge_returns_merged_value() {
        let mut engine = engine("n1");
        engine.start().unwrap();

        engine.merge_shared_data(crdt_datum("k", 100, &["x"])).unwrap();
        let merged = engine.merge_shared_data(crdt_datum("k", 200, &["y"])).unwrap();
        assert_eq!(merged, Crdt::set_of(["x", "y"]));

        let stored = engine.find_shared_gossip_data("k").unwrap().unwrap();
        assert_eq!(stored.node_id, NodeId::from("n1"));
        assert_eq!(stored.timestamp, 200);

        engine.shutdown().unwrap();
    }

    /// Tests that shutdown is idempotent and start/shutdown cycles cleanly
    #[test]
    fn test_shutdown_idempotent() {
        let mut engine = engine("n1");
        engine.start().unwrap();
        engine.start().unwrap(); // no-op while running

        engine.shutdown().unwrap();
        engine.shutdown().unwrap();
        assert!(matches!(engine.live_members(), Err(GossipError::NotRunning)));
    }
}
