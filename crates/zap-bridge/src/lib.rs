//! # zap-bridge
//!
//! Session transport that speaks JSON over a WebSocket to an external
//! protocol bridge. The bridge owns the WhatsApp wire protocol; this crate
//! only relays pairing codes, lifecycle changes, credentials and messages.

pub mod protocol;
pub mod transport;

pub use transport::BridgeTransportFactory;
