//! Defines the message types exchanged between gossip peers along with the
//! codec and transport seams the engine plugs external collaborators into
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]

pub mod codec;
pub mod errors;
pub mod message;
pub mod mocks;
pub mod transport;
