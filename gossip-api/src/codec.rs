//! Protocol codecs and the name → codec registry
//!
//! The engine resolves its codec from a configuration string; adding a wire
//! format means adding a registry entry, not loading classes at runtime.

use std::sync::Arc;

use crate::{errors::WireError, message::GossipMessage};

/// Encodes and decodes gossip messages to and from wire frames
pub trait ProtocolCodec: Send + Sync {
    /// Encode a message into a frame
    fn encode(&self, message: &GossipMessage) -> Result<Vec<u8>, WireError>;
    /// Decode a frame into a message
    fn decode(&self, frame: &[u8]) -> Result<GossipMessage, WireError>;
}

/// The registered name of the bincode codec
pub const BINCODE_CODEC: &str = "bincode";
/// The registered name of the JSON codec
pub const JSON_CODEC: &str = "json";

/// Resolve a codec from its registered name
pub fn resolve_codec(name: &str) -> Result<Arc<dyn ProtocolCodec>, WireError> {
    match name {
        BINCODE_CODEC => Ok(Arc::new(BincodeCodec)),
        JSON_CODEC => Ok(Arc::new(JsonCodec)),
        _ => Err(WireError::UnknownCodec(name.to_string())),
    }
}

/// The default compact binary codec
#[derive(Clone, Copy, Debug)]
pub struct BincodeCodec;

impl ProtocolCodec for BincodeCodec {
    fn encode(&self, message: &GossipMessage) -> Result<Vec<u8>, WireError> {
        bincode::serialize(message).map_err(|err| WireError::Encode(err.to_string()))
    }

    fn decode(&self, frame: &[u8]) -> Result<GossipMessage, WireError> {
        bincode::deserialize(frame).map_err(|err| WireError::Decode(err.to_string()))
    }
}

/// A human-readable codec, handy when inspecting traffic by hand
#[derive(Clone, Copy, Debug)]
pub struct JsonCodec;

impl ProtocolCodec for JsonCodec {
    fn encode(&self, message: &GossipMessage) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(message).map_err(|err| WireError::Encode(err.to_string()))
    }

    fn decode(&self, frame: &[u8]) -> Result<GossipMessage, WireError> {
        serde_json::from_slice(frame).map_err(|err| WireError::Decode(err.to_string()))
    }
}

#[cfg(test)]
mod test {
    use common::types::{
        member::{Endpoint, Member},
        NodeId,
    };

    use crate::message::{GossipMessage, MembershipListMessage};

    use super::{resolve_codec, ProtocolCodec, BINCODE_CODEC, JSON_CODEC};

    /// Builds a small membership message for codec tests
    fn test_message() -> GossipMessage {
        let mut sender =
            Member::new("cluster", NodeId::from("n1"), Endpoint::new("udp", "10.0.0.1", 9000));
        sender.heartbeat = 42;
        GossipMessage::MembershipList(MembershipListMessage { sender, known: vec![] })
    }

    /// Tests that both registered codecs round-trip a message
    #[test]
    fn test_registered_codecs() {
        for name in [BINCODE_CODEC, JSON_CODEC] {
            let codec = resolve_codec(name).unwrap();
            let message = test_message();

            let frame = codec.encode(&message).unwrap();
            assert_eq!(codec.decode(&frame).unwrap(), message);
        }
    }

    /// Tests that unknown codec names are rejected
    #[test]
    fn test_unknown_codec() {
        assert!(resolve_codec("protobuf").is_err());
    }

    /// Tests that garbage frames surface a decode error
    #[test]
    fn test_decode_garbage() {
        let codec = resolve_codec(BINCODE_CODEC).unwrap();
        assert!(codec.decode(&[0xff, 0xff, 0xff, 0xff]).is_err());
    }
}
