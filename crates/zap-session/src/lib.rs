//! # zap-session
//!
//! Connection lifecycle for WhatsApp sessions: one supervisor actor per
//! session drives its transport through the connection state machine,
//! reconnects with exponential backoff, and relays transport events to the
//! credential store and the message buffer. The [`Registry`] maps session
//! ids to their supervisors.

pub mod policy;
pub mod registry;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use policy::SessionPolicy;
pub use registry::Registry;
pub use supervisor::{ConnectionState, SessionHandle};
