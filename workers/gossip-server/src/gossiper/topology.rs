//! The topology-aware active gossiper
//!
//! Runs the full tiered schedule: for each of the rack, datacenter, and
//! remote tiers, three repeating tasks push membership, per-node data, and
//! shared data at that tier's period; a tenth task pings DOWN peers. All
//! pushes delegate to the same sender machinery the uniform variant uses.

use std::{sync::Arc, time::Duration};

use common::types::{new_cancel_channel, CancelSender};
use config::GossipIntervals;
use tracing::info;

use crate::{errors::GossipError, timers::RepeatingTimer};

use super::{ActiveGossiper, GossipSender, Tier, ALL_TIERS};

/// The topology-aware gossiper
pub struct TopologyGossiper {
    /// The push machinery
    sender: Arc<GossipSender>,
    /// The configured tier periods
    intervals: GossipIntervals,
    /// The cancel sender for the repeating tasks; dropped to stop them
    cancel: Option<CancelSender>,
    /// The repeating push tasks
    timers: Vec<RepeatingTimer>,
}

impl TopologyGossiper {
    /// Constructor
    pub fn new(sender: Arc<GossipSender>, intervals: GossipIntervals) -> Self {
        Self { sender, intervals, cancel: None, timers: Vec::new() }
    }
}

impl ActiveGossiper for TopologyGossiper {
    fn start(&mut self) -> Result<(), GossipError> {
        let (cancel_tx, cancel_rx) = new_cancel_channel();

        for tier in ALL_TIERS {
            let period = tier.period(&self.intervals);
            let label = tier.label();

            let sender = self.sender.clone();
            self.timers.push(RepeatingTimer::spawn(
                &format!("gossip-membership-{label}"),
                period,
                cancel_rx.clone(),
                move || sender.gossip_membership_tier(tier),
            )?);

            let sender = self.sender.clone();
            self.timers.push(RepeatingTimer::spawn(
                &format!("gossip-per-node-{label}"),
                period,
                cancel_rx.clone(),
                move || sender.gossip_per_node_tier(tier),
            )?);

            let sender = self.sender.clone();
            self.timers.push(RepeatingTimer::spawn(
                &format!("gossip-shared-{label}"),
                period,
                cancel_rx.clone(),
                move || sender.gossip_shared_tier(tier),
            )?);
        }

        let sender = self.sender.clone();
        self.timers.push(RepeatingTimer::spawn(
            "gossip-dead-ping",
            Duration::from_millis(self.intervals.dead_ms),
            cancel_rx,
            move || sender.ping_dead_peer(),
        )?);

        self.cancel = Some(cancel_tx);
        info!("topology gossiper started with {} tasks", self.timers.len());
        Ok(())
    }

    fn shutdown(&mut self) {
        drop(self.cancel.take());
        for timer in self.timers.drain(..) {
            timer.join();
        }
    }

    fn send_membership_list(&self) {
        for tier in ALL_TIERS {
            self.sender.gossip_membership_tier(tier);
        }
    }

    fn send_per_node_data(&self) {
        for tier in ALL_TIERS {
            self.sender.gossip_per_node_tier(tier);
        }
    }

    fn send_shared_data(&self) {
        for tier in ALL_TIERS {
            self.sender.gossip_shared_tier(tier);
        }
    }
}

impl Drop for TopologyGossiper {
    fn drop(&mut self) {
        self.shutdown();
    }
}
