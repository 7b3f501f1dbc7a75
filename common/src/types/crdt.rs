//! Conflict-free replicated datatypes carried as shared gossip payloads
//!
//! Every variant's `merge` is commutative, associative, and idempotent, so
//! the data store may apply updates in any arrival order and still converge.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::NodeId;

/// A CRDT payload variant
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Crdt {
    /// A set that only grows; merge is set union
    GrowOnlySet(BTreeSet<String>),
    /// A counter with one non-decreasing slot per contributing node; merge
    /// takes the per-node max, the counter's value is the sum of the slots
    GrowOnlyCounter(BTreeMap<NodeId, u64>),
}

impl Crdt {
    /// An empty grow-only set
    pub fn empty_set() -> Self {
        Self::GrowOnlySet(BTreeSet::new())
    }

    /// A grow-only set over the given elements
    pub fn set_of<I, S>(elements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::GrowOnlySet(elements.into_iter().map(Into::into).collect())
    }

    /// A grow-only counter with a single contribution from the given node
    pub fn counter_of(node_id: NodeId, count: u64) -> Self {
        let mut slots = BTreeMap::new();
        slots.insert(node_id, count);
        Self::GrowOnlyCounter(slots)
    }

    /// Merge two CRDTs of the same variant
    ///
    /// Returns `None` when the variants differ; callers decide how to treat
    /// the incompatibility
    pub fn merge(&self, other: &Crdt) -> Option<Crdt> {
        match (self, other) {
            (Crdt::GrowOnlySet(lhs), Crdt::GrowOnlySet(rhs)) => {
                Some(Crdt::GrowOnlySet(lhs.union(rhs).cloned().collect()))
            },
            (Crdt::GrowOnlyCounter(lhs), Crdt::GrowOnlyCounter(rhs)) => {
                let mut merged = lhs.clone();
                for (node, count) in rhs.iter() {
                    let slot = merged.entry(node.clone()).or_insert(0);
                    *slot = (*slot).max(*count);
                }
                Some(Crdt::GrowOnlyCounter(merged))
            },
            _ => None,
        }
    }

    /// The scalar value of a counter; `None` for non-counter variants
    pub fn counter_value(&self) -> Option<u64> {
        match self {
            Crdt::GrowOnlyCounter(slots) => Some(slots.values().sum()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use crate::types::NodeId;

    use super::Crdt;

    /// Tests that set merge is a union and is order-independent
    #[test]
    fn test_set_merge_commutes() {
        let a = Crdt::set_of(["x", "y"]);
        let b = Crdt::set_of(["y", "z"]);

        let ab = a.merge(&b).unwrap();
        let ba = b.merge(&a).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab, Crdt::set_of(["x", "y", "z"]));
    }

    /// Tests that merging a set with itself is a no-op
    #[test]
    fn test_set_merge_idempotent() {
        let a = Crdt::set_of(["x", "y"]);
        assert_eq!(a.merge(&a).unwrap(), a);
    }

    /// Tests per-node max semantics of the counter merge
    #[test]
    fn test_counter_merge() {
        let n1 = NodeId::from("n1");
        let n2 = NodeId::from("n2");

        let a = Crdt::counter_of(n1.clone(), 3);
        let b = Crdt::counter_of(n1, 5).merge(&Crdt::counter_of(n2, 2)).unwrap();

        let merged = a.merge(&b).unwrap();
        // n1 keeps its max contribution (5), n2 contributes 2
        assert_eq!(merged.counter_value(), Some(7));
    }

    /// Tests that mismatched variants refuse to merge
    #[test]
    fn test_variant_mismatch() {
        let set = Crdt::set_of(["x"]);
        let counter = Crdt::counter_of(NodeId::from("n1"), 1);
        assert!(set.merge(&counter).is_none());
    }
}
