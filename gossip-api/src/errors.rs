//! Errors thrown at the wire boundary

use thiserror::Error;

/// An error encoding, decoding, or moving frames between peers
#[derive(Clone, Debug, Error)]
pub enum WireError {
    /// A message failed to encode
    #[error("message encoding failed: {0}")]
    Encode(String),
    /// A frame failed to decode
    #[error("frame decoding failed: {0}")]
    Decode(String),
    /// No codec is registered under the requested name
    #[error("unknown codec: {0}")]
    UnknownCodec(String),
    /// No transport is registered under the requested name
    #[error("unknown transport: {0}")]
    UnknownTransport(String),
    /// The send path failed unrecoverably
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
}
