//! Mock implementations for testing
//!
//! Provides a mock [`Transport`] that records traffic and can answer
//! requests through a canned [`MockPlatform`], so the client can be tested
//! without an MQTT broker.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::protocol::{EnrollRequest, PropertyRequest};
use crate::transport::{mqtt::ConnectionState, InboundHandler, InboundMessage, Transport};
use async_trait::async_trait;
use rumqttc::QoS;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::Mutex;

pub type PublishedMessage = (String, Vec<u8>);

type Responder = Box<dyn Fn(&str, &[u8]) -> Option<InboundMessage> + Send + Sync>;

/// Mock transport for testing
#[derive(Default)]
pub struct MockTransport {
    pub published_messages: Arc<Mutex<Vec<PublishedMessage>>>,
    pub subscriptions: Arc<Mutex<Vec<String>>>,
    pub unsubscriptions: Arc<Mutex<Vec<String>>>,
    pub connect_history: Arc<Mutex<Vec<ClientConfig>>>,
    pub should_fail: bool,
    fail_publish: AtomicBool,
    reject_subscriptions: AtomicBool,
    state: StdMutex<ConnectionState>,
    handler: StdMutex<Option<Arc<dyn InboundHandler>>>,
    responder: StdMutex<Option<Responder>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport whose `connect` always fails
    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    /// Transport that starts out connected, with no inbound handler
    pub fn connected() -> Self {
        let transport = Self::default();
        transport.set_state(ConnectionState::Connected);
        transport
    }

    /// Transport that answers requests the way the platform would
    pub fn with_platform(platform: MockPlatform) -> Self {
        let transport = Self::default();
        transport.set_responder(move |topic, payload| platform.respond(topic, payload));
        transport
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn require_connected(&self) -> Result<(), ClientError> {
        match self.connection_state() {
            ConnectionState::Connected => Ok(()),
            state => Err(ClientError::not_connected(state)),
        }
    }

    fn current_handler(&self) -> Option<Arc<dyn InboundHandler>> {
        self.handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Answer every publish for which `responder` returns a message
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&str, &[u8]) -> Option<InboundMessage> + Send + Sync + 'static,
    {
        *self.responder.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(responder));
    }

    /// Install an inbound handler without going through `connect`
    pub fn attach_handler(&self, handler: Arc<dyn InboundHandler>) {
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Make the broker refuse every subscription, as a SUBACK failure code would
    pub fn reject_subscriptions(&self, reject: bool) {
        self.reject_subscriptions.store(reject, Ordering::SeqCst);
    }

    /// Push an inbound message through the installed handler
    pub fn deliver(&self, message: InboundMessage) -> bool {
        match self.current_handler() {
            Some(handler) => {
                handler.on_message(message);
                true
            }
            None => false,
        }
    }

    /// Drop the session as if the network had gone away
    pub fn simulate_connection_loss(&self, reason: &str) {
        self.set_state(ConnectionState::Disconnected);
        if let Some(handler) = self.current_handler() {
            handler.on_connection_lost(&ClientError::connection(reason));
        }
    }

    pub async fn get_published_messages(&self) -> Vec<PublishedMessage> {
        self.published_messages.lock().await.clone()
    }

    /// Published messages decoded as JSON, for payload assertions
    pub async fn get_published_json(&self) -> Vec<(String, Value)> {
        self.published_messages
            .lock()
            .await
            .iter()
            .map(|(topic, payload)| {
                let value = serde_json::from_slice(payload).unwrap_or(Value::Null);
                (topic.clone(), value)
            })
            .collect()
    }

    pub async fn get_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().await.clone()
    }

    pub async fn get_unsubscriptions(&self) -> Vec<String> {
        self.unsubscriptions.lock().await.clone()
    }

    pub async fn get_connect_history(&self) -> Vec<ClientConfig> {
        self.connect_history.lock().await.clone()
    }

    pub async fn clear_history(&self) {
        self.published_messages.lock().await.clear();
        self.subscriptions.lock().await.clear();
        self.unsubscriptions.lock().await.clear();
        self.connect_history.lock().await.clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        config: &ClientConfig,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<(), ClientError> {
        match self.connection_state() {
            ConnectionState::Connected => return Err(ClientError::AlreadyConnected),
            ConnectionState::Connecting => return Err(ClientError::AlreadyConnecting),
            _ => {}
        }
        self.connect_history.lock().await.push(config.clone());

        if self.should_fail {
            return Err(ClientError::connection("Mock connection failure"));
        }

        self.attach_handler(handler);
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        self.set_state(ConnectionState::Disconnected);
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, _qos: QoS) -> Result<(), ClientError> {
        self.require_connected()?;
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(ClientError::connection("Mock publish failure"));
        }

        let reply = {
            let responder = self.responder.lock().unwrap_or_else(PoisonError::into_inner);
            responder
                .as_ref()
                .and_then(|respond| respond(topic, payload.as_slice()))
        };
        self.published_messages
            .lock()
            .await
            .push((topic.to_string(), payload));

        if let Some(reply) = reply {
            self.deliver(reply);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), ClientError> {
        self.require_connected()?;
        if self.reject_subscriptions.load(Ordering::SeqCst) {
            return Err(ClientError::subscription_rejected(topic));
        }
        self.subscriptions.lock().await.push(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), ClientError> {
        self.require_connected()?;
        self.unsubscriptions.lock().await.push(topic.to_string());
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Canned platform behaviour for property and enrollment requests
///
/// Gets answer from an in-memory property map (missing keys fail with code
/// 404), sets update the map, and every enrollment is accepted with
/// `id = "dev-{hwid}"` and `auth = "token-{hwid}"`.
#[derive(Debug, Clone, Default)]
pub struct MockPlatform {
    properties: Arc<StdMutex<HashMap<String, Value>>>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_property(self, key: &str, value: Value) -> Self {
        self.properties
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
        self
    }

    pub fn property(&self, key: &str) -> Option<Value> {
        self.properties
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Reply to a published request, if it is one the platform answers
    pub fn respond(&self, topic: &str, payload: &[u8]) -> Option<InboundMessage> {
        let segments: Vec<&str> = topic.split('/').collect();
        match segments.as_slice() {
            [plug, "property", "get"] => {
                let request: PropertyRequest = serde_json::from_slice(payload).ok()?;
                let body = match self.property(&request.key) {
                    Some(value) => json!({"cid": request.cid, "key": request.key, "value": value}),
                    None => json!({
                        "cid": request.cid,
                        "key": request.key,
                        "error": {"code": 404, "message": "property not found"}
                    }),
                };
                Some(reply(format!("{plug}/property/reply"), body))
            }
            [plug, "property", "set"] => {
                let request: PropertyRequest = serde_json::from_slice(payload).ok()?;
                self.properties
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(request.key.clone(), request.value.unwrap_or(Value::Null));
                Some(reply(
                    format!("{plug}/property/reply"),
                    json!({"cid": request.cid, "key": request.key}),
                ))
            }
            ["enroll", _] | ["enroll", _, "ctrl"] => {
                let request: EnrollRequest = serde_json::from_slice(payload).ok()?;
                Some(reply(
                    format!("enroll/{}/reply", request.hwid),
                    json!({"id": format!("dev-{}", request.hwid), "auth": format!("token-{}", request.hwid)}),
                ))
            }
            _ => None,
        }
    }
}

fn reply(topic: String, body: Value) -> InboundMessage {
    InboundMessage::new(topic, body.to_string(), false)
}
