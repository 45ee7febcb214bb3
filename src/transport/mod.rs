//! Transport layer for the CloudPlugs client
//!
//! This module provides the transport abstraction the client is built on and
//! its MQTT implementation. The abstraction exposes the raw MQTT primitives
//! (connect, publish, subscribe, unsubscribe) plus a single inbound callback,
//! so the correlation and dispatch layers can be tested without a broker.

use crate::config::ClientConfig;
use crate::error::ClientError;
use bytes::Bytes;
use rumqttc::QoS;
use std::sync::Arc;

pub mod mqtt;

pub use mqtt::ConnectionState;

/// One inbound MQTT delivery
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub retained: bool,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, retained: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retained,
        }
    }
}

/// Receiver of everything the transport delivers
///
/// Called from the transport's own delivery task, one message at a time in
/// arrival order. Implementations must return quickly.
pub trait InboundHandler: Send + Sync {
    /// Every inbound publish, regardless of which subscription produced it
    fn on_message(&self, message: InboundMessage);

    /// The session ended without an explicit disconnect
    fn on_connection_lost(&self, error: &ClientError);
}

/// Transport trait for the client
///
/// This trait provides an abstraction over the MQTT session to enable
/// dependency injection and testing.
///
/// State machine: `Disconnected -> Connecting -> Connected -> Disconnecting
/// -> Disconnected`. A failed connect returns to `Disconnected`. Nothing
/// reconnects automatically.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Open the session and start delivering inbound messages to `handler`
    ///
    /// Fails with `AlreadyConnecting`/`AlreadyConnected` instead of queueing
    /// when a session is already being established or is up.
    async fn connect(
        &self,
        config: &ClientConfig,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<(), ClientError>;

    /// Close the session; a no-op when already disconnected
    async fn disconnect(&self) -> Result<(), ClientError>;

    /// Publish raw bytes on a topic
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), ClientError>;

    /// Subscribe to a topic filter; subscribing twice collapses to one subscription
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), ClientError>;

    /// Unsubscribe from a topic filter
    async fn unsubscribe(&self, topic: &str) -> Result<(), ClientError>;

    /// Get current connection state
    fn connection_state(&self) -> ConnectionState;

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }
}

/// Type alias for MQTT transport
pub type MqttTransport = mqtt::MqttTransport;
