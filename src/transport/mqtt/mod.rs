//! rumqttc-backed MQTT transport
//!
//! The module separates pure functions from I/O operations:
//!
//! - [`connection`] - Pure connection state management and option building
//! - [`message_handler`] - Pure event routing and error classification
//! - [`suback`] - Pairs SUBACKs with the subscribe calls waiting on them
//! - [`client`] - Event loop task and the [`Transport`](crate::transport::Transport) impl
//!
//! # Usage
//!
//! ```rust,no_run
//! use cloudplugs_mqtt::config::ClientConfig;
//! use cloudplugs_mqtt::transport::{InboundHandler, InboundMessage, MqttTransport, Transport};
//! use cloudplugs_mqtt::error::ClientError;
//! use std::sync::Arc;
//!
//! struct Print;
//!
//! impl InboundHandler for Print {
//!     fn on_message(&self, message: InboundMessage) {
//!         println!("{}: {:?}", message.topic, message.payload);
//!     }
//!     fn on_connection_lost(&self, error: &ClientError) {
//!         eprintln!("lost: {error}");
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let config = ClientConfig::with_credentials("dev-0000000000000001", "secret");
//! let transport = MqttTransport::new();
//! transport.connect(&config, Arc::new(Print)).await?;
//! transport.disconnect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;
pub mod suback;

pub use client::MqttTransport;
pub use connection::{ConnectionEvent, ConnectionState};
pub use message_handler::{ClientErrorKind, EventRoute, MessageHandler};
