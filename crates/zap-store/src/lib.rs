//! # zap-store
//!
//! Persistent credential store and event journal (SQLite-backed).

pub mod store;

pub use store::Store;
