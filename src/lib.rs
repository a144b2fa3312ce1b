//! packetd - a cellular packet-data connection daemon.
//!
//! Tracks a modem's packet-switched attach state, owns the catalogue of
//! user-defined data contexts (APN profiles), drives context activation
//! against an AT-command back-end and publishes the result on the bus.

/// Connection core: manager, contexts, bindings, persistence.
pub mod connection;

/// Modem transport and AT dialect layer.
pub mod modem;

/// Tracing initialization for the daemon binary.
pub mod tracing_config;

pub use connection::{ConnectionManager, Error};
