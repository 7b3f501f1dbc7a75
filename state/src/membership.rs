//! The cluster membership table
//!
//! An ordered mapping from member key to the member's last advertised state
//! and an UP/DOWN verdict. Reads hand out ordered copies; writes take the
//! table lock briefly and never perform I/O. State changes are fanned out to
//! registered listeners off the mutating thread, one listener at a time.

use std::{
    collections::{btree_map::Entry, BTreeMap},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
};

use common::types::{
    member::{Member, MemberKey, PeerState},
    NodeId,
};
use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::{error, info};

use crate::failure_detector::FailureDetector;

// -------------
// | Listeners |
// -------------

/// Receives membership state-change events
///
/// Listeners are invoked sequentially on the fan-out thread; a panicking
/// listener is logged and does not affect the others
pub trait GossipListener: Send + Sync {
    /// A member's state changed
    fn on_member_change(&self, member: &Member, state: PeerState);
}

/// A membership state change queued for listener fan-out
#[derive(Clone, Debug)]
pub struct MembershipEvent {
    /// The member whose state changed
    pub member: Member,
    /// The state the member changed to
    pub state: PeerState,
}

/// A registered listener and the handle it may be unregistered by
struct ListenerEntry {
    /// The registration handle
    id: usize,
    /// The listener
    listener: Arc<dyn GossipListener>,
}

// ---------
// | Table |
// ---------

/// One member's row in the table
#[derive(Clone, Debug)]
struct MemberEntry {
    /// The member, carrying the greatest heartbeat observed so far
    member: Member,
    /// The current verdict for the member
    state: PeerState,
}

/// The ordered membership table
///
/// The local member is never present here; it is carried separately by the
/// engine
pub struct MembershipTable {
    /// The failure detector notified of heartbeat arrivals
    detector: Arc<FailureDetector>,
    /// The member rows, ordered lexicographically on (cluster, node id) so
    /// snapshots iterate identically on every node
    members: RwLock<BTreeMap<MemberKey, MemberEntry>>,
    /// The registered listeners
    listeners: RwLock<Vec<ListenerEntry>>,
    /// The next listener registration handle
    next_listener_id: AtomicUsize,
    /// The queue of state changes awaiting fan-out
    event_sender: Sender<MembershipEvent>,
    /// The receiving half of the event queue, taken once by the fan-out
    /// thread at engine start
    event_receiver: Mutex<Option<Receiver<MembershipEvent>>>,
}

impl MembershipTable {
    /// Constructor
    pub fn new(detector: Arc<FailureDetector>) -> Self {
        let (event_sender, event_receiver) = unbounded();
        Self {
            detector,
            members: RwLock::new(BTreeMap::new()),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicUsize::new(0),
            event_sender,
            event_receiver: Mutex::new(Some(event_receiver)),
        }
    }

    // -----------
    // | Writers |
    // -----------

    /// Seed a member into the table as DOWN at bootstrap
    ///
    /// A member already present is left untouched
    pub fn seed(&self, member: Member) {
        let mut members = self.members.write().expect("members lock poisoned");
        if let Entry::Vacant(entry) = members.entry(member.key()) {
            entry.insert(MemberEntry { member, state: PeerState::Down });
        }
    }

    /// Apply a member advertisement carried by an inbound heartbeat
    ///
    /// A first-seen member is inserted DOWN with the advertised heartbeat. A
    /// known member is updated only when the advertised heartbeat strictly
    /// exceeds the stored one, in which case the arrival is reported to the
    /// failure detector and the property map replaced if it changed. Stale
    /// and duplicate heartbeats are ignored, keeping the stored counter
    /// non-decreasing under any message interleaving.
    pub fn upsert_from_heartbeat(&self, incoming: Member, now_ns: u64) {
        let key = incoming.key();

        // Read first: most gossip repeats a view the table already holds
        {
            let members = self.members.read().expect("members lock poisoned");
            if let Some(entry) = members.get(&key) {
                if incoming.heartbeat <= entry.member.heartbeat {
                    return;
                }
            }
        } // read lock released

        let mut arrival = None;
        {
            let mut members = self.members.write().expect("members lock poisoned");
            match members.entry(key) {
                Entry::Vacant(entry) => {
                    entry.insert(MemberEntry { member: incoming, state: PeerState::Down });
                },
                Entry::Occupied(mut entry) => {
                    let row = entry.get_mut();
                    // Re-check under the write lock; a racing writer may have
                    // advanced the counter past the incoming advertisement
                    if incoming.heartbeat <= row.member.heartbeat {
                        return;
                    }

                    row.member.heartbeat = incoming.heartbeat;
                    if row.member.properties != incoming.properties {
                        row.member.properties = incoming.properties;
                    }
                    arrival = Some(row.member.node_id.clone());
                },
            }
        } // write lock released

        if let Some(node_id) = arrival {
            self.detector.report(&node_id, now_ns);
        }
    }

    /// Set a member's state, emitting a listener event on change
    ///
    /// Returns whether the state actually changed
    pub fn set_state(&self, key: &MemberKey, state: PeerState) -> bool {
        let changed = {
            let mut members = self.members.write().expect("members lock poisoned");
            match members.get_mut(key) {
                Some(row) if row.state != state => {
                    row.state = state;
                    Some(row.member.clone())
                },
                _ => None,
            }
        }; // write lock released

        match changed {
            Some(member) => {
                info!("member {} is now {state}", member.node_id);
                // The fan-out thread may already be gone during shutdown
                let _ = self.event_sender.send(MembershipEvent { member, state });
                true
            },
            None => false,
        }
    }

    /// Force a member DOWN immediately, bypassing the failure detector
    ///
    /// Used for shutdown notices; purely an optimization, the detector
    /// converges on the same verdict without it
    pub fn force_down(&self, key: &MemberKey) {
        self.set_state(key, PeerState::Down);
    }

    // -----------
    // | Readers |
    // -----------

    /// An ordered copy of all members currently UP
    pub fn snapshot_live(&self) -> Vec<Member> {
        self.snapshot_filtered(|state| state == PeerState::Up)
    }

    /// An ordered copy of all members currently DOWN
    pub fn snapshot_dead(&self) -> Vec<Member> {
        self.snapshot_filtered(|state| state == PeerState::Down)
    }

    /// An ordered copy of every member with its state
    pub fn snapshot_all(&self) -> Vec<(Member, PeerState)> {
        let members = self.members.read().expect("members lock poisoned");
        members.values().map(|row| (row.member.clone(), row.state)).collect()
    }

    /// The stored state of a member, if known
    pub fn state_of(&self, key: &MemberKey) -> Option<PeerState> {
        let members = self.members.read().expect("members lock poisoned");
        members.get(key).map(|row| row.state)
    }

    /// The stored heartbeat counter of a member, if known
    pub fn heartbeat_of(&self, key: &MemberKey) -> Option<u64> {
        let members = self.members.read().expect("members lock poisoned");
        members.get(key).map(|row| row.member.heartbeat)
    }

    /// Find a member's key by node ID
    pub fn key_of(&self, node_id: &NodeId) -> Option<MemberKey> {
        let members = self.members.read().expect("members lock poisoned");
        members.keys().find(|key| &key.node_id == node_id).cloned()
    }

    /// An ordered copy of members passing the given state filter
    fn snapshot_filtered<F: Fn(PeerState) -> bool>(&self, filter: F) -> Vec<Member> {
        let members = self.members.read().expect("members lock poisoned");
        members.values().filter(|row| filter(row.state)).map(|row| row.member.clone()).collect()
    }

    // -------------
    // | Listeners |
    // -------------

    /// Register a listener, returning its unregistration handle
    pub fn register_listener(&self, listener: Arc<dyn GossipListener>) -> usize {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().expect("listeners lock poisoned").push(ListenerEntry { id, listener });
        id
    }

    /// Unregister a previously registered listener
    pub fn unregister_listener(&self, id: usize) {
        self.listeners.write().expect("listeners lock poisoned").retain(|entry| entry.id != id);
    }

    /// Take the event receiver; the engine's fan-out thread drains it
    pub fn take_event_receiver(&self) -> Option<Receiver<MembershipEvent>> {
        self.event_receiver.lock().expect("event receiver lock poisoned").take()
    }

    /// Invoke every registered listener for an event, sequentially
    ///
    /// A panicking listener is logged and skipped; the rest still run
    pub fn notify_listeners(&self, event: &MembershipEvent) {
        let listeners: Vec<Arc<dyn GossipListener>> = {
            let listeners = self.listeners.read().expect("listeners lock poisoned");
            listeners.iter().map(|entry| entry.listener.clone()).collect()
        }; // read lock released

        for listener in listeners {
            let result = catch_unwind(AssertUnwindSafe(|| {
                listener.on_member_change(&event.member, event.state)
            }));
            if result.is_err() {
                error!("membership listener panicked handling {} -> {}", event.member.node_id, event.state);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use common::types::{
        member::{Endpoint, Member, PeerState},
        NodeId,
    };
    use config::FailureDetectorConfig;
    use rand::{seq::SliceRandom, thread_rng};

    use crate::failure_detector::FailureDetector;

    use super::{GossipListener, MembershipTable};

    /// Builds a table over a fresh detector
    fn table() -> MembershipTable {
        MembershipTable::new(Arc::new(FailureDetector::new(FailureDetectorConfig::default())))
    }

    /// Builds a member with the given node id and heartbeat
    fn member(id: &str, heartbeat: u64) -> Member {
        let mut member =
            Member::new("cluster", NodeId::from(id), Endpoint::new("udp", "10.0.0.1", 9000));
        member.heartbeat = heartbeat;
        member
    }

    /// A listener that counts invocations
    struct CountingListener(AtomicUsize);
    impl GossipListener for CountingListener {
        fn on_member_change(&self, _member: &Member, _state: PeerState) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Tests that a first-seen member is inserted DOWN
    #[test]
    fn test_first_sight_is_down() {
        let table = table();
        let m = member("n1", 5);
        table.upsert_from_heartbeat(m.clone(), 0);

        assert_eq!(table.state_of(&m.key()), Some(PeerState::Down));
        assert_eq!(table.heartbeat_of(&m.key()), Some(5));
    }

    /// Tests that the stored heartbeat is non-decreasing under any
    /// interleaving of inbound advertisements
    #[test]
    fn test_heartbeat_monotonic() {
        let table = table();
        let key = member("n1", 0).key();

        let mut heartbeats: Vec<u64> = (1..=50).collect();
        heartbeats.shuffle(&mut thread_rng());

        let mut high_water = 0;
        for heartbeat in heartbeats {
            table.upsert_from_heartbeat(member("n1", heartbeat), heartbeat * 1_000);
            high_water = high_water.max(heartbeat);
            assert_eq!(table.heartbeat_of(&key), Some(high_water));
        }
    }

    /// Tests that snapshots iterate in key order
    #[test]
    fn test_snapshot_ordering() {
        let table = table();
        for id in ["n3", "n1", "n2"] {
            table.seed(member(id, 0));
        }

        let ids: Vec<String> =
            table.snapshot_dead().iter().map(|m| m.node_id.to_string()).collect();
        assert_eq!(ids, vec!["n1", "n2", "n3"]);
    }

    /// Tests that state changes fire listener events exactly on change
    #[test]
    fn test_listener_fires_on_change_only() {
        let table = table();
        let m = member("n1", 1);
        table.upsert_from_heartbeat(m.clone(), 0);

        let listener = Arc::new(CountingListener(AtomicUsize::new(0)));
        table.register_listener(listener.clone());

        let events = table.take_event_receiver().unwrap();
        assert!(table.set_state(&m.key(), PeerState::Up));
        assert!(!table.set_state(&m.key(), PeerState::Up)); // no-op
        assert!(table.set_state(&m.key(), PeerState::Down));

        let mut fanned_out = 0;
        while let Ok(event) = events.try_recv() {
            table.notify_listeners(&event);
            fanned_out += 1;
        }
        assert_eq!(fanned_out, 2);
        assert_eq!(listener.0.load(Ordering::SeqCst), 2);
    }

    /// Tests that a panicking listener does not starve the others
    #[test]
    fn test_listener_panic_isolated() {
        /// A listener that always panics
        struct PanickingListener;
        impl GossipListener for PanickingListener {
            fn on_member_change(&self, _member: &Member, _state: PeerState) {
                panic!("listener bug");
            }
        }

        let table = table();
        let m = member("n1", 1);
        table.upsert_from_heartbeat(m.clone(), 0);

        let counter = Arc::new(CountingListener(AtomicUsize::new(0)));
        table.register_listener(Arc::new(PanickingListener));
        table.register_listener(counter.clone());

        let events = table.take_event_receiver().unwrap();
        table.set_state(&m.key(), PeerState::Up);
        table.notify_listeners(&events.try_recv().unwrap());

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    /// Tests forcing a member down and that a later heartbeat still lands
    #[test]
    fn test_force_down_then_heartbeat() {
        let table = table();
        let m = member("n1", 1);
        table.upsert_from_heartbeat(m.clone(), 0);
        table.set_state(&m.key(), PeerState::Up);

        table.force_down(&m.key());
        assert_eq!(table.state_of(&m.key()), Some(PeerState::Down));

        // A DOWN peer still accepts heartbeats without re-bootstrapping
        table.upsert_from_heartbeat(member("n1", 2), 1_000);
        assert_eq!(table.heartbeat_of(&m.key()), Some(2));
    }
}
