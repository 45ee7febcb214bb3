//! CloudPlugs MQTT device client
//!
//! A device-facing client for the CloudPlugs IoT platform, which is reachable
//! only through an MQTT broker. On top of plain publish/subscribe the crate
//! provides plug-scoped data topics and correlated request/response
//! exchanges (property get/set and device enrollment) over one connection.
//!
//! # Overview
//!
//! - [`protocol`] - Topic layout, input validation and payload envelopes
//! - [`transport`] - Transport abstraction and its rumqttc implementation
//! - [`correlator`] - Pending request table and request/response matching
//! - [`dispatcher`] - Routing of inbound messages to replies or the application
//! - [`client`] - The [`CloudPlugsClient`] facade
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use cloudplugs_mqtt::{ClientConfig, CloudPlugsClient};
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let client = CloudPlugsClient::new(ClientConfig::with_credentials(
//!     "dev-0000000000000001",
//!     "auth-token",
//! ))?;
//! client.connect().await?;
//!
//! client.publish("temperature", r#"{"celsius": 21.5}"#).await?;
//! client.set_property("mode", json!("eco")).await?;
//! let mode = client.get_property("mode").await?;
//! assert_eq!(mode, json!("eco"));
//!
//! client.disconnect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod config;
pub mod correlator;
pub mod dispatcher;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use client::{CloudPlugsClient, PublishOptions, SubscribeOptions};
pub use config::{ClientConfig, ConfigError};
pub use correlator::RequestKind;
pub use dispatcher::{ChannelSink, MessageSink, SinkEvent};
pub use error::{ClientError, ClientResult};
pub use protocol::{EnrollCredentials, TopicBuilder, ValidationError};
pub use transport::{ConnectionState, InboundMessage, MqttTransport, Transport};
