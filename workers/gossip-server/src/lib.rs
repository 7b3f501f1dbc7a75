//! The gossip server: periodic epidemic dissemination of membership and
//! data, failure-detection driven UP/DOWN refresh, expired-data reaping,
//! and the engine tying the pieces to the transport and codec seams
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]

pub mod dispatcher;
pub mod engine;
pub mod errors;
pub mod gossiper;
pub mod pool;
pub mod reaper;
pub mod refresher;
pub mod timers;
pub mod worker;
