//! The replicated data store
//!
//! Two maps: per-node data keyed by (node id, key) and shared data keyed by
//! key alone. Non-CRDT values replicate last-writer-wins on the producer
//! timestamp with a deterministic fingerprint tie-break; CRDT values merge.
//! Expired entries are invisible to lookups immediately and physically
//! removed by the reaper.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, RwLock,
    },
};

use common::{
    clock::Clock,
    types::{
        datum::{GossipPayload, PerNodeDatum, SharedDatum},
        NodeId,
    },
};
use tracing::{debug, warn};

// ---------------
// | Subscribers |
// ---------------

/// Receives per-node data change notifications
///
/// Invoked after the store has been updated, with the previous and new
/// values; eviction passes `None` for the new value
pub trait PerNodeDataSubscriber: Send + Sync {
    /// A per-node datum changed
    fn on_per_node_change(&self, old: Option<&PerNodeDatum>, new: Option<&PerNodeDatum>);
}

/// Receives shared data change notifications
pub trait SharedDataSubscriber: Send + Sync {
    /// A shared datum changed
    fn on_shared_change(&self, old: Option<&SharedDatum>, new: Option<&SharedDatum>);
}

/// A registered subscriber and its unregistration handle
struct SubscriberEntry<T: ?Sized> {
    /// The registration handle
    id: usize,
    /// The subscriber
    subscriber: Arc<T>,
}

// ---------
// | Store |
// ---------

/// The per-node and shared data maps
pub struct DataStore {
    /// The clock expiry checks read the wall time from
    clock: Arc<dyn Clock>,
    /// Per-node data: node id -> key -> datum
    per_node: RwLock<HashMap<NodeId, HashMap<String, PerNodeDatum>>>,
    /// Shared data: key -> datum
    shared: RwLock<HashMap<String, SharedDatum>>,
    /// The registered per-node subscribers
    per_node_subscribers: RwLock<Vec<SubscriberEntry<dyn PerNodeDataSubscriber>>>,
    /// The registered shared subscribers
    shared_subscribers: RwLock<Vec<SubscriberEntry<dyn SharedDataSubscriber>>>,
    /// The next subscriber registration handle
    next_subscriber_id: AtomicUsize,
}

impl DataStore {
    /// Constructor
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            per_node: RwLock::new(HashMap::new()),
            shared: RwLock::new(HashMap::new()),
            per_node_subscribers: RwLock::new(Vec::new()),
            shared_subscribers: RwLock::new(Vec::new()),
            next_subscriber_id: AtomicUsize::new(0),
        }
    }

    // -----------
    // | Writers |
    // -----------

    /// Apply a per-node datum under last-writer-wins
    ///
    /// Returns whether the datum was stored
    pub fn add_per_node(&self, datum: PerNodeDatum) -> bool {
        let old = {
            let mut per_node = self.per_node.write().expect("per-node lock poisoned");
            let node_map = per_node.entry(datum.node_id.clone()).or_default();

            let current = node_map.get(&datum.key).cloned();
            if let Some(existing) = &current {
                if !supersedes(
                    datum.timestamp,
                    &datum.payload,
                    existing.timestamp,
                    &existing.payload,
                ) {
                    return false;
                }
            }

            node_map.insert(datum.key.clone(), datum.clone());
            current
        }; // write lock released

        self.notify_per_node(old.as_ref(), Some(&datum));
        true
    }

    /// Apply a shared datum: CRDT payloads merge, everything else is
    /// last-writer-wins
    ///
    /// Returns whether the stored value changed
    pub fn add_shared(&self, datum: SharedDatum) -> bool {
        let (old, new) = {
            let mut shared = self.shared.write().expect("shared lock poisoned");
            match shared.get(&datum.key).cloned() {
                None => {
                    shared.insert(datum.key.clone(), datum.clone());
                    (None, datum)
                },
                Some(existing) => {
                    let merged = match merge_shared(&existing, &datum) {
                        Some(merged) if merged != existing => merged,
                        _ => return false,
                    };

                    shared.insert(datum.key.clone(), merged.clone());
                    (Some(existing), merged)
                },
            }
        }; // write lock released

        self.notify_shared(old.as_ref(), Some(&new));
        true
    }

    // -----------
    // | Readers |
    // -----------

    /// Look up a per-node datum; `None` if absent or expired
    pub fn find_per_node(&self, node_id: &NodeId, key: &str) -> Option<PerNodeDatum> {
        let now_ms = self.clock.now_ms() as i64;
        let per_node = self.per_node.read().expect("per-node lock poisoned");
        per_node
            .get(node_id)
            .and_then(|node_map| node_map.get(key))
            .filter(|datum| !datum.is_expired(now_ms))
            .cloned()
    }

    /// Look up a shared datum; `None` if absent or expired
    pub fn find_shared(&self, key: &str) -> Option<SharedDatum> {
        let now_ms = self.clock.now_ms() as i64;
        let shared = self.shared.read().expect("shared lock poisoned");
        shared.get(key).filter(|datum| !datum.is_expired(now_ms)).cloned()
    }

    /// An unexpired copy of all per-node data
    pub fn per_node_snapshot(&self) -> Vec<PerNodeDatum> {
        let now_ms = self.clock.now_ms() as i64;
        let per_node = self.per_node.read().expect("per-node lock poisoned");
        per_node
            .values()
            .flat_map(|node_map| node_map.values())
            .filter(|datum| !datum.is_expired(now_ms))
            .cloned()
            .collect()
    }

    /// An unexpired copy of all shared data
    pub fn shared_snapshot(&self) -> Vec<SharedDatum> {
        let now_ms = self.clock.now_ms() as i64;
        let shared = self.shared.read().expect("shared lock poisoned");
        shared.values().filter(|datum| !datum.is_expired(now_ms)).cloned().collect()
    }

    // -----------
    // | Reaping |
    // -----------

    /// Physically remove every expired entry, notifying subscribers with
    /// (old, None); returns the number of entries removed
    pub fn reap_expired(&self) -> usize {
        let now_ms = self.clock.now_ms() as i64;

        let mut reaped_per_node = Vec::new();
        {
            let mut per_node = self.per_node.write().expect("per-node lock poisoned");
            for node_map in per_node.values_mut() {
                let expired: Vec<String> = node_map
                    .iter()
                    .filter(|(_, datum)| datum.is_expired(now_ms))
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in expired {
                    if let Some(datum) = node_map.remove(&key) {
                        reaped_per_node.push(datum);
                    }
                }
            }
            per_node.retain(|_, node_map| !node_map.is_empty());
        } // write lock released

        let mut reaped_shared = Vec::new();
        {
            let mut shared = self.shared.write().expect("shared lock poisoned");
            let expired: Vec<String> = shared
                .iter()
                .filter(|(_, datum)| datum.is_expired(now_ms))
                .map(|(key, _)| key.clone())
                .collect();
            for key in expired {
                if let Some(datum) = shared.remove(&key) {
                    reaped_shared.push(datum);
                }
            }
        } // write lock released

        let reaped = reaped_per_node.len() + reaped_shared.len();
        if reaped > 0 {
            debug!("reaped {reaped} expired data entries");
        }

        for datum in &reaped_per_node {
            self.notify_per_node(Some(datum), None);
        }
        for datum in &reaped_shared {
            self.notify_shared(Some(datum), None);
        }

        reaped
    }

    // ---------------
    // | Subscribers |
    // ---------------

    /// Register a per-node subscriber, returning its handle
    pub fn register_per_node_subscriber(&self, subscriber: Arc<dyn PerNodeDataSubscriber>) -> usize {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.per_node_subscribers
            .write()
            .expect("subscribers lock poisoned")
            .push(SubscriberEntry { id, subscriber });
        id
    }

    /// Unregister a per-node subscriber
    pub fn unregister_per_node_subscriber(&self, id: usize) {
        self.per_node_subscribers
            .write()
            .expect("subscribers lock poisoned")
            .retain(|entry| entry.id != id);
    }

    /// Register a shared subscriber, returning its handle
    pub fn register_shared_subscriber(&self, subscriber: Arc<dyn SharedDataSubscriber>) -> usize {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.shared_subscribers
            .write()
            .expect("subscribers lock poisoned")
            .push(SubscriberEntry { id, subscriber });
        id
    }

    /// Unregister a shared subscriber
    pub fn unregister_shared_subscriber(&self, id: usize) {
        self.shared_subscribers
            .write()
            .expect("subscribers lock poisoned")
            .retain(|entry| entry.id != id);
    }

    /// Notify per-node subscribers of a change, sequentially
    fn notify_per_node(&self, old: Option<&PerNodeDatum>, new: Option<&PerNodeDatum>) {
        let subscribers: Vec<Arc<dyn PerNodeDataSubscriber>> = {
            let subscribers = self.per_node_subscribers.read().expect("subscribers lock poisoned");
            subscribers.iter().map(|entry| entry.subscriber.clone()).collect()
        }; // read lock released

        for subscriber in subscribers {
            subscriber.on_per_node_change(old, new);
        }
    }

    /// Notify shared subscribers of a change, sequentially
    fn notify_shared(&self, old: Option<&SharedDatum>, new: Option<&SharedDatum>) {
        let subscribers: Vec<Arc<dyn SharedDataSubscriber>> = {
            let subscribers = self.shared_subscribers.read().expect("subscribers lock poisoned");
            subscribers.iter().map(|entry| entry.subscriber.clone()).collect()
        }; // read lock released

        for subscriber in subscribers {
            subscriber.on_shared_change(old, new);
        }
    }
}

// -----------
// | Helpers |
// -----------

/// Whether a candidate (timestamp, payload) supersedes the current one
///
/// Larger timestamp wins; equal timestamps fall back to the lexicographically
/// greater payload fingerprint so that every node settles on the same value
fn supersedes(
    candidate_ts: i64,
    candidate_payload: &GossipPayload,
    current_ts: i64,
    current_payload: &GossipPayload,
) -> bool {
    if candidate_ts != current_ts {
        return candidate_ts > current_ts;
    }
    candidate_payload.fingerprint() > current_payload.fingerprint()
}

/// The value a shared slot should hold after observing `incoming` on top of
/// `current`; `None` when the slot should be left alone
fn merge_shared(current: &SharedDatum, incoming: &SharedDatum) -> Option<SharedDatum> {
    if let (GossipPayload::Crdt(lhs), GossipPayload::Crdt(rhs)) =
        (&current.payload, &incoming.payload)
    {
        match lhs.merge(rhs) {
            Some(merged) => {
                return Some(SharedDatum {
                    key: current.key.clone(),
                    node_id: incoming.node_id.clone(),
                    timestamp: current.timestamp.max(incoming.timestamp),
                    expire_at: later_expiry(current.expire_at, incoming.expire_at),
                    payload: GossipPayload::Crdt(merged),
                });
            },
            None => {
                warn!("mismatched CRDT variants on shared key {}, keeping newer value", current.key);
            },
        }
    }

    // Last-writer-wins for raw payloads and mismatched CRDT variants
    supersedes(incoming.timestamp, &incoming.payload, current.timestamp, &current.payload)
        .then(|| incoming.clone())
}

/// The later of two expiry deadlines, where `None` means never expires
fn later_expiry(lhs: Option<i64>, rhs: Option<i64>) -> Option<i64> {
    match (lhs, rhs) {
        (Some(a), Some(b)) => Some(a.max(b)),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use common::{
        clock::mocks::MockClock,
        types::{
            crdt::Crdt,
            datum::{GossipPayload, PerNodeDatum, SharedDatum},
            NodeId,
        },
    };
    use rand::{seq::SliceRandom, thread_rng};

    use super::{DataStore, PerNodeDataSubscriber, SharedDataSubscriber};

    /// Builds a store over a mock clock
    fn store() -> (DataStore, Arc<MockClock>) {
        let clock = Arc::new(MockClock::new());
        (DataStore::new(clock.clone()), clock)
    }

    /// Builds a per-node datum
    fn per_node(key: &str, timestamp: i64, payload: &[u8]) -> PerNodeDatum {
        PerNodeDatum {
            node_id: NodeId::from("n1"),
            key: key.to_string(),
            timestamp,
            expire_at: None,
            payload: GossipPayload::Bytes(payload.to_vec()),
        }
    }

    /// Builds a shared datum with a CRDT payload
    fn shared_crdt(key: &str, timestamp: i64, crdt: Crdt) -> SharedDatum {
        SharedDatum {
            key: key.to_string(),
            node_id: NodeId::from("n1"),
            timestamp,
            expire_at: None,
            payload: GossipPayload::Crdt(crdt),
        }
    }

    /// Tests last-writer-wins on distinct timestamps regardless of order
    #[test]
    fn test_last_writer_wins() {
        let (store, _) = store();

        let mut data: Vec<PerNodeDatum> =
            (1..=20).map(|ts| per_node("k", ts, &ts.to_le_bytes())).collect();
        data.shuffle(&mut thread_rng());

        for datum in data {
            store.add_per_node(datum);
        }

        let winner = store.find_per_node(&NodeId::from("n1"), "k").unwrap();
        assert_eq!(winner.timestamp, 20);
    }

    /// Tests the deterministic fingerprint tie-break on equal timestamps
    #[test]
    fn test_timestamp_tie_break() {
        let a = per_node("k", 100, b"aaa");
        let b = per_node("k", 100, b"zzz");
        let expected = if a.payload.fingerprint() > b.payload.fingerprint() {
            a.clone()
        } else {
            b.clone()
        };

        // Either insertion order settles on the fingerprint winner
        for order in [[a.clone(), b.clone()], [b, a]] {
            let (store, _) = store();
            for datum in order {
                store.add_per_node(datum);
            }
            assert_eq!(store.find_per_node(&NodeId::from("n1"), "k").unwrap(), expected);
        }
    }

    /// Tests that CRDT shared data merges rather than replaces, converging
    /// on the same value under any arrival order
    #[test]
    fn test_crdt_convergence() {
        let updates = vec![
            shared_crdt("k", 100, Crdt::set_of(["x"])),
            shared_crdt("k", 200, Crdt::set_of(["y"])),
            shared_crdt("k", 150, Crdt::set_of(["z"])),
        ];

        let mut orders = vec![updates.clone()];
        let mut reversed = updates.clone();
        reversed.reverse();
        orders.push(reversed);

        for order in orders {
            let (store, _) = store();
            for datum in order {
                store.add_shared(datum);
            }

            let merged = store.find_shared("k").unwrap();
            assert_eq!(merged.timestamp, 200);
            assert_eq!(merged.payload, GossipPayload::Crdt(Crdt::set_of(["x", "y", "z"])));
        }
    }

    /// Tests that re-applying the same CRDT update is a no-op
    #[test]
    fn test_crdt_idempotent() {
        let (store, _) = store();
        let datum = shared_crdt("k", 100, Crdt::set_of(["x", "y"]));

        assert!(store.add_shared(datum.clone()));
        assert!(!store.add_shared(datum));
    }

    /// Tests that expiry hides data from lookups before the reaper runs
    #[test]
    fn test_expiry_hides_before_reap() {
        let (store, clock) = store();
        clock.set_ms(1_000);

        let mut datum = per_node("k", 1_000, b"v");
        datum.expire_at = Some(1_500);
        store.add_per_node(datum);

        clock.set_ms(1_499);
        assert!(store.find_per_node(&NodeId::from("n1"), "k").is_some());

        clock.set_ms(1_500);
        assert!(store.find_per_node(&NodeId::from("n1"), "k").is_none());
        assert!(store.per_node_snapshot().is_empty());
    }

    /// Tests that the reaper removes expired entries and notifies
    /// subscribers with (old, None)
    #[test]
    fn test_reap_notifies_subscribers() {
        /// Records evictions it sees
        struct EvictionRecorder(Mutex<Vec<String>>);
        impl PerNodeDataSubscriber for EvictionRecorder {
            fn on_per_node_change(&self, old: Option<&PerNodeDatum>, new: Option<&PerNodeDatum>) {
                if new.is_none() {
                    self.0.lock().unwrap().push(old.unwrap().key.clone());
                }
            }
        }

        let (store, clock) = store();
        clock.set_ms(1_000);

        let recorder = Arc::new(EvictionRecorder(Mutex::new(Vec::new())));
        store.register_per_node_subscriber(recorder.clone());

        let mut datum = per_node("k", 1_000, b"v");
        datum.expire_at = Some(1_500);
        store.add_per_node(datum);

        clock.set_ms(2_000);
        assert_eq!(store.reap_expired(), 1);
        assert_eq!(*recorder.0.lock().unwrap(), vec!["k".to_string()]);
        assert_eq!(store.reap_expired(), 0); // nothing left
    }

    /// Tests subscriber notification on shared updates and unregistration
    #[test]
    fn test_shared_subscriber_lifecycle() {
        /// Counts invocations
        struct Counter(AtomicUsize);
        impl SharedDataSubscriber for Counter {
            fn on_shared_change(&self, _old: Option<&SharedDatum>, _new: Option<&SharedDatum>) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (store, _) = store();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let id = store.register_shared_subscriber(counter.clone());

        store.add_shared(shared_crdt("k", 100, Crdt::set_of(["x"])));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        store.unregister_shared_subscriber(id);
        store.add_shared(shared_crdt("k", 200, Crdt::set_of(["y"])));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
