//! # zap-core
//!
//! Core types, traits, configuration, and error handling shared by the
//! session supervisor, the credential store and the transports.

pub mod config;
pub mod error;
pub mod message;
pub mod traits;

pub use config::shellexpand;
