//! Observability for the CloudPlugs client
//!
//! The library only emits `tracing` events and spans; installing a
//! subscriber is left to the application. The `cloudplugs` binary uses
//! [`init_default_logging`].

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
