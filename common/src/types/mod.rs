//! Defines common types used throughout the gossip node

use std::{fmt::Display, ops::Deref};

use crossbeam::channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

pub mod crdt;
pub mod datum;
pub mod member;

/// The channel on which a coordinator signals a worker to cancel execution
pub type CancelChannel = Receiver<()>;
/// The sending half of a cancel channel
pub type CancelSender = Sender<()>;

/// Create a new cancel channel pair
///
/// Dropping the sender also cancels the receiver side
pub fn new_cancel_channel() -> (CancelSender, CancelChannel) {
    bounded(1 /* cap */)
}

/// An opaque node identifier, globally unique within a cluster
///
/// Wraps the raw string so that ordering, display, and serde behavior are
/// pinned in one place
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    /// Construct a node ID from anything string-like
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }
}

impl Deref for NodeId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}
