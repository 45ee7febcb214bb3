//! Testing utilities and mock implementations
//!
//! This module provides mock implementations for testing the client without
//! an MQTT broker.

pub mod mocks;

pub use mocks::*;
