//! Testing utilities and mock implementations
//!
//! This module provides an in-memory protocol engine so the session and client
//! can be exercised without an MQTT broker.

pub mod mocks;

pub use mocks::*;
