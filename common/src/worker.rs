//! Defines the `Worker` lifecycle interface implemented by long-running
//! components of the node

use std::{fmt::Debug, thread::JoinHandle};

/// A long-lived worker started by the node's coordinator
///
/// Workers are constructed from a config, started onto their own threads,
/// and joined by the coordinator; a recoverable worker may be torn down and
/// reconstructed from its config after a failure
pub trait Worker: Sized {
    /// The configuration the worker is constructed from
    type WorkerConfig;
    /// The error type the worker's threads resolve to
    type Error: Debug + Send;

    /// Construct the worker from its config without starting it
    fn new(config: Self::WorkerConfig) -> Result<Self, Self::Error>;

    /// A display name for the worker, used in logs and thread names
    fn name(&self) -> String;

    /// Whether the coordinator may rebuild this worker after a failure
    fn is_recoverable(&self) -> bool;

    /// Begin the worker's execution
    fn start(&mut self) -> Result<(), Self::Error>;

    /// The join handles of the worker's threads
    fn join(&mut self) -> Vec<JoinHandle<Self::Error>>;

    /// Tear down any resources the worker holds
    fn cleanup(&mut self) -> Result<(), Self::Error>;
}
