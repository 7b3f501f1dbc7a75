//! Fixed-delay repeating timers
//!
//! Each timer owns a named thread that sleeps on the cancel channel between
//! ticks: a timeout means "tick", a message or a dropped sender means stop.
//! Because ticks run on the timer thread itself, consecutive ticks are
//! spaced by at least the period (fixed delay, not fixed rate).

use std::{
    thread::{self, JoinHandle},
    time::Duration,
};

use common::types::CancelChannel;
use crossbeam::channel::RecvTimeoutError;

use crate::errors::GossipError;

/// A repeating fixed-delay task on its own named thread
#[derive(Debug)]
pub struct RepeatingTimer {
    /// The join handle of the timer thread
    handle: Option<JoinHandle<GossipError>>,
}

impl RepeatingTimer {
    /// Spawn a timer invoking `tick` every `period` until cancelled
    pub fn spawn<F>(
        name: &str,
        period: Duration,
        cancel: CancelChannel,
        mut tick: F,
    ) -> Result<Self, GossipError>
    where
        F: FnMut() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                match cancel.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => tick(),
                    // A cancel message or a dropped sender both stop the timer
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        return GossipError::Cancelled("cancel signal received".to_string());
                    },
                }
            })
            .map_err(|err| GossipError::Setup(err.to_string()))?;

        Ok(Self { handle: Some(handle) })
    }

    /// Take the timer thread's join handle
    pub fn join_handle(&mut self) -> Option<JoinHandle<GossipError>> {
        self.handle.take()
    }

    /// Block until the timer thread exits
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
