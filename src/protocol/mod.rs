//! CloudPlugs wire protocol: topic layout and payload envelopes
//!
//! Everything in this module is pure; nothing here touches the network.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
