//! Errors thrown by the gossip server

use gossip_api::errors::WireError;
use thiserror::Error;

/// The error type surfaced by the gossip engine and its workers
///
/// The first four kinds are API-visible; the rest arise inside periodic
/// tasks, where they are logged and the task continues at its next tick
#[derive(Clone, Debug, Error)]
pub enum GossipError {
    /// A gossip API call carried a null or malformed field
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    /// An API call arrived before start or after stop
    #[error("engine is not running")]
    NotRunning,
    /// Consensus on a lock key could not be established
    #[error("vote failed: {0}")]
    VoteFailed(String),
    /// The send path failed unrecoverably
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
    /// A collaborator could not be constructed or started
    #[error("setup failed: {0}")]
    Setup(String),
    /// An inbound frame failed to parse
    #[error("parse failure: {0}")]
    Parse(String),
    /// An outbound message could not be handed to the transport
    #[error("failed to send message: {0}")]
    SendMessage(String),
    /// A timer thread failed
    #[error("timer failed: {0}")]
    TimerFailed(String),
    /// A worker thread observed the cancel signal
    #[error("worker cancelled: {0}")]
    Cancelled(String),
}

impl From<WireError> for GossipError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Decode(msg) => GossipError::Parse(msg),
            WireError::Encode(msg) => GossipError::SendMessage(msg),
            WireError::TransportUnavailable(msg) => GossipError::TransportUnavailable(msg),
            WireError::UnknownCodec(msg) | WireError::UnknownTransport(msg) => {
                GossipError::Setup(msg)
            },
        }
    }
}
