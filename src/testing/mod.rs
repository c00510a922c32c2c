//! Testing utilities and mock implementations
//!
//! Mocks for the transport seams so the RPC service and presence sessions
//! can be exercised without an MQTT broker or a presence server.

pub mod mocks;

pub use mocks::*;
