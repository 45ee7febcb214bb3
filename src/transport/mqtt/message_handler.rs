//! Pure event routing for the MQTT event loop
//!
//! This module contains pure functions that classify rumqttc events and
//! errors, so the event loop in `client` only decides what to do with them.

use crate::error::ClientError;
use crate::transport::InboundMessage;
use rumqttc::{ConnectReturnCode, ConnectionError, Event, Outgoing, Packet, SubscribeReasonCode};

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => match &connack.code {
                    ConnectReturnCode::Success => EventRoute::ConnectionAcknowledged,
                    code => EventRoute::ConnectionRefused(Self::classify_refusal(code).into()),
                },
                Packet::Publish(publish) => EventRoute::MessageReceived(InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                    retained: publish.retain,
                }),
                Packet::Disconnect => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    granted: suback
                        .return_codes
                        .iter()
                        .map(|code| matches!(code, SubscribeReasonCode::Success(_)))
                        .collect(),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                EventRoute::SubscribeSent { packet_id: *pkid }
            }
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Map a refused CONNACK onto the client's error kinds (pure function)
    pub fn classify_refusal(code: &ConnectReturnCode) -> ClientError {
        match code {
            ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
                ClientError::auth(format!("broker refused credentials: {code:?}"))
            }
            other => ClientError::connection(format!("broker refused connection: {other:?}")),
        }
    }

    /// Map an event loop error onto the client's error kinds (pure function)
    pub fn classify_connection_error(error: &ConnectionError) -> ClientError {
        match error {
            ConnectionError::ConnectionRefused(code) => Self::classify_refusal(code),
            other => ClientError::connection(other.to_string()),
        }
    }

    /// Validate subscription success from SubAck (pure function)
    pub fn validate_subscription_success(granted: &[bool]) -> Result<(), String> {
        if granted.iter().all(|ok| *ok) {
            Ok(())
        } else {
            Err(format!("Subscription rejected by broker: {granted:?}"))
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// CONNACK carried a refusal code
    ConnectionRefused(ClientErrorKind),
    /// Message received on a subscribed topic
    MessageReceived(InboundMessage),
    /// MQTT broker disconnected
    Disconnected,
    /// SUBSCRIBE written to the broker under this packet id
    SubscribeSent { packet_id: u16 },
    /// Subscription confirmed; one flag per requested filter
    SubscriptionConfirmed { packet_id: u16, granted: Vec<bool> },
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// `ClientError` is not `Clone`; routes carry this cloneable summary instead
#[derive(Debug, Clone, PartialEq)]
pub enum ClientErrorKind {
    Auth(String),
    Connection(String),
}

impl From<ClientError> for ClientErrorKind {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::Auth { message } => ClientErrorKind::Auth(message),
            other => ClientErrorKind::Connection(other.to_string()),
        }
    }
}

impl From<ClientErrorKind> for ClientError {
    fn from(kind: ClientErrorKind) -> Self {
        match kind {
            ClientErrorKind::Auth(message) => ClientError::Auth { message },
            ClientErrorKind::Connection(message) => ClientError::Connection { message },
        }
    }
}
