//! The uniform active gossiper
//!
//! Treats every live peer alike: three repeating push tasks (membership,
//! per-node data, shared data) at the data gossip period, plus the DOWN-peer
//! ping that bootstraps seeded and partitioned peers back into the ring.

use std::sync::Arc;

use common::types::{new_cancel_channel, CancelSender};
use config::GossipIntervals;
use tracing::info;

use crate::{errors::GossipError, timers::RepeatingTimer};

use super::{ActiveGossiper, GossipSender, Tier};

/// The uniform gossiper
pub struct UniformGossiper {
    /// The push machinery
    sender: Arc<GossipSender>,
    /// The configured push periods
    intervals: GossipIntervals,
    /// The cancel sender for the repeating tasks; dropped to stop them
    cancel: Option<CancelSender>,
    /// The repeating push tasks
    timers: Vec<RepeatingTimer>,
}

impl UniformGossiper {
    /// Constructor
    pub fn new(sender: Arc<GossipSender>, intervals: GossipIntervals) -> Self {
        Self { sender, intervals, cancel: None, timers: Vec::new() }
    }
}

impl ActiveGossiper for UniformGossiper {
    fn start(&mut self) -> Result<(), GossipError> {
        let (cancel_tx, cancel_rx) = new_cancel_channel();
        let period = Tier::SameDc.period(&self.intervals);

        let sender = self.sender.clone();
        self.timers.push(RepeatingTimer::spawn(
            "gossip-membership",
            period,
            cancel_rx.clone(),
            move || sender.gossip_membership(),
        )?);

        let sender = self.sender.clone();
        self.timers.push(RepeatingTimer::spawn(
            "gossip-per-node",
            period,
            cancel_rx.clone(),
            move || sender.gossip_per_node(),
        )?);

        let sender = self.sender.clone();
        self.timers.push(RepeatingTimer::spawn(
            "gossip-shared",
            period,
            cancel_rx.clone(),
            move || sender.gossip_shared(),
        )?);

        let sender = self.sender.clone();
        self.timers.push(RepeatingTimer::spawn(
            "gossip-dead-ping",
            std::time::Duration::from_millis(self.intervals.dead_ms),
            cancel_rx,
            move || sender.ping_dead_peer(),
        )?);

        self.cancel = Some(cancel_tx);
        info!("uniform gossiper started");
        Ok(())
    }

    fn shutdown(&mut self) {
        drop(self.cancel.take());
        for timer in self.timers.drain(..) {
            timer.join();
        }
    }

    fn send_membership_list(&self) {
        self.sender.gossip_membership();
    }

    fn send_per_node_data(&self) {
        self.sender.gossip_per_node();
    }

    fn send_shared_data(&self) {
        self.sender.gossip_shared();
    }
}

impl Drop for UniformGossiper {
    fn drop(&mut self) {
        self.shutdown();
    }
}
