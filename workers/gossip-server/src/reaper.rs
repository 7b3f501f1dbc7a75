//! The expired-data reaper
//!
//! Lookups already hide expired entries; the reaper's job is to physically
//! remove them and fire the (old, None) eviction notifications.

use std::{sync::Arc, time::Duration};

use common::types::CancelChannel;
use state::GossipState;

use crate::{errors::GossipError, timers::RepeatingTimer};

/// Start the repeating reap task
pub fn start_reaper(
    state: Arc<GossipState>,
    period: Duration,
    cancel: CancelChannel,
) -> Result<RepeatingTimer, GossipError> {
    RepeatingTimer::spawn("data-reaper", period, cancel, move || {
        state.store().reap_expired();
    })
}
