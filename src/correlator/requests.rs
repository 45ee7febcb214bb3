//! Correlated request execution
//!
//! Sequence for every request: register, subscribe to the response topic,
//! publish, then wait for exactly one of reply, timeout or connection loss.
//! The response topic is unsubscribed again once no request waits on it.
//! A caller that drops the future cancels its request.

use super::table::{KeySource, RequestTable};
use super::RequestKind;
use crate::error::ClientError;
use crate::protocol::{
    correlation_id, decode_reply, validate_identity, EnrollRequest, IdentityKind,
    PropertyRequest, Reply, TopicBuilder, ValidationError,
};
use crate::transport::{InboundMessage, Transport};
use rumqttc::QoS;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

/// Correlation key of an enrollment for `hwid`
pub fn enrollment_key(hwid: &str) -> String {
    format!("enroll/{hwid}")
}

/// Everything needed to send one correlated request
#[derive(Debug, Clone)]
pub struct CorrelatedRequest {
    pub kind: RequestKind,
    pub key: String,
    pub request_topic: String,
    pub response_topic: String,
    pub key_source: KeySource,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub timeout: Duration,
}

impl CorrelatedRequest {
    pub fn get_property(
        plug_id: &str,
        key: &str,
        qos: QoS,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        Self::property(RequestKind::GetProperty, plug_id, key, None, qos, timeout)
    }

    pub fn set_property(
        plug_id: &str,
        key: &str,
        value: Value,
        qos: QoS,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        Self::property(
            RequestKind::SetProperty,
            plug_id,
            key,
            Some(value),
            qos,
            timeout,
        )
    }

    fn property(
        kind: RequestKind,
        plug_id: &str,
        key: &str,
        value: Option<Value>,
        qos: QoS,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        if key.is_empty() {
            return Err(ValidationError::EmptyPropertyKey.into());
        }

        let cid = Uuid::new_v4().to_string();
        let (request_topic, request) = match value {
            Some(value) => (
                TopicBuilder::build_property_set_topic(plug_id)?,
                PropertyRequest::set(&cid, key, value),
            ),
            None => (
                TopicBuilder::build_property_get_topic(plug_id)?,
                PropertyRequest::get(&cid, key),
            ),
        };

        Ok(Self {
            kind,
            response_topic: TopicBuilder::build_property_reply_topic(plug_id)?,
            request_topic,
            key_source: KeySource::PayloadField,
            payload: request.to_payload()?,
            key: cid,
            qos,
            timeout,
        })
    }

    pub fn enroll(
        hwid: &str,
        model_id: &str,
        password: &str,
        qos: QoS,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let request_topic = TopicBuilder::build_enroll_topic(hwid)?;
        Self::enrollment(
            RequestKind::Enroll,
            hwid,
            model_id,
            None,
            password,
            request_topic,
            qos,
            timeout,
        )
    }

    pub fn enroll_ctrl(
        hwid: &str,
        model_id: &str,
        ctrl_hwid: &str,
        password: &str,
        qos: QoS,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let request_topic = TopicBuilder::build_enroll_ctrl_topic(ctrl_hwid)?;
        Self::enrollment(
            RequestKind::EnrollCtrl,
            hwid,
            model_id,
            Some(ctrl_hwid),
            password,
            request_topic,
            qos,
            timeout,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn enrollment(
        kind: RequestKind,
        hwid: &str,
        model_id: &str,
        ctrl_hwid: Option<&str>,
        password: &str,
        request_topic: String,
        qos: QoS,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        validate_identity(model_id, IdentityKind::ModelId)?;

        let key = enrollment_key(hwid);
        let request = EnrollRequest {
            hwid: hwid.to_string(),
            model: model_id.to_string(),
            pass: password.to_string(),
            ctrl: ctrl_hwid.map(str::to_string),
        };

        Ok(Self {
            kind,
            request_topic,
            response_topic: TopicBuilder::build_enroll_reply_topic(hwid)?,
            key_source: KeySource::Fixed(key.clone()),
            payload: request.to_payload()?,
            key,
            qos,
            timeout,
        })
    }
}

/// What happened to an inbound message offered to the correlator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Completed a pending request
    Resolved,
    /// Late or duplicate reply for a request that is already finished
    Discarded,
    /// Not a reply to anything this client sent
    Unclaimed,
}

/// Stops the deadline timer once `run` returns, and withdraws a request whose
/// caller stopped waiting
struct CancelOnDrop {
    correlator: Arc<Correlator>,
    key: String,
    seq: u64,
    timer: AbortHandle,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.timer.abort();
        // No-op once reply, timeout or abort has removed the entry
        if let Some(pending) = self.correlator.table.expire(&self.key, self.seq) {
            debug!(key = %self.key, "Correlated request cancelled");
            self.correlator.spawn_release(pending.response_topic);
        }
    }
}

/// Drives correlated requests over a [`Transport`]
pub struct Correlator {
    transport: Arc<dyn Transport>,
    table: Arc<RequestTable>,
    // Serializes response topic subscribe/unsubscribe decisions
    subscription_gate: Mutex<()>,
}

impl Correlator {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            table: Arc::new(RequestTable::new()),
            subscription_gate: Mutex::new(()),
        }
    }

    pub fn table(&self) -> &Arc<RequestTable> {
        &self.table
    }

    /// Send a request and wait for its reply, timeout or connection loss
    ///
    /// Dropping the returned future withdraws the request.
    pub async fn execute(self: &Arc<Self>, request: CorrelatedRequest) -> Result<Reply, ClientError> {
        let span = info_span!("correlated_request", kind = %request.kind, key = %request.key);
        self.run(request).instrument(span).await
    }

    async fn run(self: &Arc<Self>, request: CorrelatedRequest) -> Result<Reply, ClientError> {
        let CorrelatedRequest {
            kind,
            key,
            request_topic,
            response_topic,
            key_source,
            payload,
            qos,
            timeout,
        } = request;

        let registration = self
            .table
            .register(&key, kind, &response_topic, key_source, timeout)?;
        let timer = self.arm_timer(key.clone(), registration.seq, kind, registration.deadline, timeout);
        let _cancel = CancelOnDrop {
            correlator: Arc::clone(self),
            key: key.clone(),
            seq: registration.seq,
            timer,
        };

        let subscribed = {
            let _gate = self.subscription_gate.lock().await;
            self.transport.subscribe(&response_topic, qos).await
        };
        if let Err(e) = subscribed {
            return Err(self.abort(&key, registration.seq, e).await);
        }

        debug!(topic = %request_topic, response_topic = %response_topic, "Publishing correlated request");
        if let Err(e) = self.transport.publish(&request_topic, payload, qos).await {
            return Err(self.abort(&key, registration.seq, e).await);
        }

        registration
            .receiver
            .await
            .unwrap_or_else(|_| Err(ClientError::connection("request dropped before completion")))
    }

    /// Remove a request that never made it onto the wire
    async fn abort(self: &Arc<Self>, key: &str, seq: u64, error: ClientError) -> ClientError {
        if let Some(pending) = self.table.expire(key, seq) {
            self.release_topic(&pending.response_topic).await;
        }
        error
    }

    fn arm_timer(
        self: &Arc<Self>,
        key: String,
        seq: u64,
        kind: RequestKind,
        deadline: Instant,
        timeout: Duration,
    ) -> AbortHandle {
        let correlator = Arc::clone(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(pending) = correlator.table.expire(&key, seq) {
                warn!(kind = %kind, key = %key, "Correlated request timed out");
                let topic = pending.response_topic.clone();
                pending.resolve(Err(ClientError::Timeout {
                    kind,
                    timeout_ms: timeout.as_millis() as u64,
                }));
                // Own task: this timer is aborted as soon as the caller wakes up
                correlator.spawn_release(topic);
            }
        });
        timer.abort_handle()
    }

    /// Offer an inbound message; resolves the matching pending request if there is one
    pub fn resolve_inbound(self: &Arc<Self>, message: &InboundMessage) -> Resolution {
        // Replies are never retained; a retained message is application data
        if message.retained {
            return Resolution::Unclaimed;
        }
        // A topic released after its last request still recognizes late replies
        let Some(source) = self
            .table
            .key_source(&message.topic)
            .or_else(|| self.table.retired_key_source(&message.topic))
        else {
            return Resolution::Unclaimed;
        };
        let key = match source {
            KeySource::Fixed(key) => key,
            KeySource::PayloadField => match correlation_id(&message.payload) {
                Some(cid) => cid,
                None => return Resolution::Unclaimed,
            },
        };

        match self.table.take(&key, &message.topic) {
            Some(pending) => {
                let outcome = decode_reply(pending.kind, &message.payload);
                if let Err(e) = &outcome {
                    debug!(key = %key, "Reply resolved with error: {}", e);
                }
                let topic = pending.response_topic.clone();
                if !pending.resolve(outcome) {
                    debug!(key = %key, "Caller stopped waiting before the reply arrived");
                }
                self.spawn_release(topic);
                Resolution::Resolved
            }
            None if self.table.is_retired(&key) => {
                debug!(key = %key, topic = %message.topic, "Discarding late reply");
                Resolution::Discarded
            }
            None => Resolution::Unclaimed,
        }
    }

    fn spawn_release(self: &Arc<Self>, topic: String) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let correlator = Arc::clone(self);
                runtime.spawn(async move { correlator.release_topic(&topic).await });
            }
            Err(_) => debug!(topic = %topic, "No runtime to release response topic"),
        }
    }

    /// Unsubscribe a response topic once no pending request uses it
    pub async fn release_topic(&self, topic: &str) {
        let _gate = self.subscription_gate.lock().await;
        if self.table.has_route(topic) || !self.transport.is_connected() {
            return;
        }
        if let Err(e) = self.transport.unsubscribe(topic).await {
            debug!(topic = %topic, "Response topic unsubscribe failed: {}", e);
        }
    }

    /// Resolve every pending request with a connection error
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained = self.table.drain();
        let count = drained.len();
        for pending in drained {
            pending.resolve(Err(ClientError::connection(format!(
                "connection lost before reply: {reason}"
            ))));
        }
        if count > 0 {
            warn!(count, "Failed pending requests after connection loss");
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.table.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EnrollCredentials;
    use crate::testing::mocks::MockTransport;
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_millis(200);

    fn connected_correlator() -> (Arc<MockTransport>, Arc<Correlator>) {
        let transport = Arc::new(MockTransport::connected());
        let correlator = Arc::new(Correlator::new(transport.clone()));
        (transport, correlator)
    }

    fn cid_of(payload: &[u8]) -> String {
        let value: Value = serde_json::from_slice(payload).unwrap();
        value["cid"].as_str().unwrap().to_string()
    }

    #[test]
    fn test_property_request_layout() {
        let request =
            CorrelatedRequest::get_property("dev-1", "mode", QoS::AtLeastOnce, TIMEOUT).unwrap();
        assert_eq!(request.request_topic, "dev-1/property/get");
        assert_eq!(request.response_topic, "dev-1/property/reply");
        assert_eq!(request.key_source, KeySource::PayloadField);
        assert_eq!(cid_of(&request.payload), request.key);
    }

    #[test]
    fn test_property_request_rejects_empty_key() {
        let result =
            CorrelatedRequest::set_property("dev-1", "", json!(1), QoS::AtLeastOnce, TIMEOUT);
        assert!(matches!(result, Err(ClientError::Validation { .. })));
    }

    #[test]
    fn test_enroll_ctrl_request_layout() {
        let request = CorrelatedRequest::enroll_ctrl(
            "HW-1",
            "model-1",
            "CTRL-9",
            "pw",
            QoS::AtLeastOnce,
            TIMEOUT,
        )
        .unwrap();
        assert_eq!(request.request_topic, "enroll/CTRL-9/ctrl");
        assert_eq!(request.response_topic, "enroll/HW-1/reply");
        assert_eq!(request.key, "enroll/HW-1");
        assert_eq!(request.key_source, KeySource::Fixed("enroll/HW-1".to_string()));
    }

    #[test]
    fn test_enroll_rejects_bad_model() {
        let result = CorrelatedRequest::enroll("HW-1", "a/b", "pw", QoS::AtLeastOnce, TIMEOUT);
        assert!(matches!(result, Err(ClientError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_refused_response_subscription_fails_request() {
        let (transport, correlator) = connected_correlator();
        transport.reject_subscriptions(true);
        let request =
            CorrelatedRequest::get_property("dev-1", "mode", QoS::AtLeastOnce, TIMEOUT).unwrap();

        let started = Instant::now();
        let result = correlator.execute(request).await;

        assert!(matches!(result, Err(ClientError::SubscriptionRejected { .. })));
        assert!(started.elapsed() < TIMEOUT);
        assert_eq!(correlator.pending(), 0);
        assert!(transport.get_published_messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_get_property_resolves_on_reply() {
        // Arrange
        let (transport, correlator) = connected_correlator();
        transport.set_responder(|topic, payload| {
            (topic == "dev-1/property/get").then(|| {
                let cid = cid_of(payload);
                InboundMessage::new(
                    "dev-1/property/reply",
                    json!({"cid": cid, "key": "mode", "value": "eco"}).to_string(),
                    false,
                )
            })
        });
        let dispatcher = crate::dispatcher::MessageDispatcher::new(correlator.clone());
        transport.attach_handler(Arc::new(dispatcher));

        // Act
        let request =
            CorrelatedRequest::get_property("dev-1", "mode", QoS::AtLeastOnce, TIMEOUT).unwrap();
        let reply = correlator.execute(request).await.unwrap();

        // Assert
        assert_eq!(reply, Reply::Value(json!("eco")));
        assert_eq!(correlator.pending(), 0);
        assert_eq!(
            transport.get_subscriptions().await,
            vec!["dev-1/property/reply".to_string()]
        );
    }

    #[tokio::test]
    async fn test_answered_request_stops_its_timer() {
        let (transport, correlator) = connected_correlator();
        transport.set_responder(|topic, payload| {
            (topic == "dev-1/property/set").then(|| {
                let cid = cid_of(payload);
                InboundMessage::new(
                    "dev-1/property/reply",
                    json!({"cid": cid, "key": "mode"}).to_string(),
                    false,
                )
            })
        });
        let dispatcher = crate::dispatcher::MessageDispatcher::new(correlator.clone());
        transport.attach_handler(Arc::new(dispatcher));
        let baseline = Arc::strong_count(&correlator);

        let request = CorrelatedRequest::set_property(
            "dev-1",
            "mode",
            json!("eco"),
            QoS::AtLeastOnce,
            Duration::from_secs(3600),
        )
        .unwrap();
        assert_eq!(correlator.execute(request).await.unwrap(), Reply::Ack);
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Neither the timer nor the release task still holds the correlator
        assert_eq!(Arc::strong_count(&correlator), baseline);
    }

    #[tokio::test]
    async fn test_timeout_resolves_with_timeout_error() {
        let (transport, correlator) = connected_correlator();

        let request = CorrelatedRequest::set_property(
            "dev-1",
            "mode",
            json!("eco"),
            QoS::AtLeastOnce,
            Duration::from_millis(30),
        )
        .unwrap();
        let result = correlator.execute(request).await;

        match result {
            Err(ClientError::Timeout { kind, timeout_ms }) => {
                assert_eq!(kind, RequestKind::SetProperty);
                assert_eq!(timeout_ms, 30);
            }
            other => panic!("Expected timeout, got {other:?}"),
        }
        assert_eq!(correlator.pending(), 0);

        // The response topic is released once the last request is gone
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            transport.get_unsubscriptions().await,
            vec!["dev-1/property/reply".to_string()]
        );
    }

    #[tokio::test]
    async fn test_late_reply_is_discarded() {
        let (transport, correlator) = connected_correlator();

        let request = CorrelatedRequest::get_property(
            "dev-1",
            "mode",
            QoS::AtLeastOnce,
            Duration::from_millis(20),
        )
        .unwrap();
        let cid = request.key.clone();
        assert!(correlator.execute(request).await.is_err());

        // A second request keeps the route alive so the late reply is inspected
        let keep_alive =
            CorrelatedRequest::get_property("dev-1", "other", QoS::AtLeastOnce, TIMEOUT).unwrap();
        let pending = {
            let correlator = correlator.clone();
            tokio::spawn(async move { correlator.execute(keep_alive).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let late = InboundMessage::new(
            "dev-1/property/reply",
            json!({"cid": cid, "value": 1}).to_string(),
            false,
        );
        assert_eq!(correlator.resolve_inbound(&late), Resolution::Discarded);

        let unknown = InboundMessage::new(
            "dev-1/property/reply",
            json!({"cid": "someone-else", "value": 1}).to_string(),
            false,
        );
        assert_eq!(correlator.resolve_inbound(&unknown), Resolution::Unclaimed);

        assert!(pending.await.unwrap().is_err());
        assert!(!transport.get_published_messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_late_reply_after_topic_release_is_discarded() {
        let (_transport, correlator) = connected_correlator();
        let request = CorrelatedRequest::get_property(
            "dev-1",
            "mode",
            QoS::AtLeastOnce,
            Duration::from_millis(20),
        )
        .unwrap();
        let cid = request.key.clone();
        assert!(matches!(
            correlator.execute(request).await,
            Err(ClientError::Timeout { .. })
        ));
        assert!(!correlator.table().has_route("dev-1/property/reply"));

        let late = InboundMessage::new(
            "dev-1/property/reply",
            json!({"cid": cid, "value": 1}).to_string(),
            false,
        );
        assert_eq!(correlator.resolve_inbound(&late), Resolution::Discarded);
    }

    #[tokio::test]
    async fn test_dropped_request_is_withdrawn() {
        let (transport, correlator) = connected_correlator();
        let request =
            CorrelatedRequest::get_property("dev-1", "mode", QoS::AtLeastOnce, TIMEOUT).unwrap();

        let result = tokio::time::timeout(Duration::from_millis(20), correlator.execute(request)).await;
        assert!(result.is_err());

        assert_eq!(correlator.pending(), 0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            transport.get_unsubscriptions().await,
            vec!["dev-1/property/reply"]
        );
    }

    #[tokio::test]
    async fn test_publish_failure_aborts_request() {
        let (transport, correlator) = connected_correlator();
        transport.fail_publishes(true);

        let request =
            CorrelatedRequest::get_property("dev-1", "mode", QoS::AtLeastOnce, TIMEOUT).unwrap();
        let result = correlator.execute(request).await;

        assert!(matches!(result, Err(ClientError::Connection { .. })));
        assert_eq!(correlator.pending(), 0);
        assert_eq!(
            transport.get_unsubscriptions().await,
            vec!["dev-1/property/reply".to_string()]
        );
    }

    #[tokio::test]
    async fn test_not_connected_fails_fast() {
        let transport = Arc::new(MockTransport::new());
        let correlator = Arc::new(Correlator::new(transport.clone()));

        let request =
            CorrelatedRequest::get_property("dev-1", "mode", QoS::AtLeastOnce, TIMEOUT).unwrap();
        let result = correlator.execute(request).await;

        assert!(matches!(result, Err(ClientError::NotConnected { .. })));
        assert_eq!(correlator.pending(), 0);
        assert!(transport.get_published_messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_fail_all_resolves_pending_with_connection_error() {
        let (_transport, correlator) = connected_correlator();

        let request =
            CorrelatedRequest::get_property("dev-1", "mode", QoS::AtLeastOnce, TIMEOUT).unwrap();
        let waiting = {
            let correlator = correlator.clone();
            tokio::spawn(async move { correlator.execute(request).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(correlator.fail_all("broker went away"), 1);
        assert!(matches!(
            waiting.await.unwrap(),
            Err(ClientError::Connection { .. })
        ));
    }

    #[tokio::test]
    async fn test_enroll_reply_routed_by_topic() {
        let (transport, correlator) = connected_correlator();

        let request =
            CorrelatedRequest::enroll("HW-1", "model-1", "pw", QoS::AtLeastOnce, TIMEOUT).unwrap();
        let waiting = {
            let correlator = correlator.clone();
            tokio::spawn(async move { correlator.execute(request).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let published = transport.get_published_messages().await;
        assert_eq!(published[0].0, "enroll/HW-1");

        let reply = InboundMessage::new(
            "enroll/HW-1/reply",
            json!({"id": "dev-42", "auth": "tok"}).to_string(),
            false,
        );
        assert_eq!(correlator.resolve_inbound(&reply), Resolution::Resolved);
        // Duplicate delivery of the same reply
        assert_eq!(correlator.resolve_inbound(&reply), Resolution::Discarded);

        assert_eq!(
            waiting.await.unwrap().unwrap(),
            Reply::Enrolled(EnrollCredentials {
                plug_id: "dev-42".to_string(),
                auth: "tok".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_retained_message_is_not_a_reply() {
        let (_transport, correlator) = connected_correlator();

        let request =
            CorrelatedRequest::enroll("HW-1", "model-1", "pw", QoS::AtLeastOnce, TIMEOUT).unwrap();
        let waiting = {
            let correlator = correlator.clone();
            tokio::spawn(async move { correlator.execute(request).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stale = InboundMessage::new(
            "enroll/HW-1/reply",
            json!({"id": "old", "auth": "old"}).to_string(),
            true,
        );
        assert_eq!(correlator.resolve_inbound(&stale), Resolution::Unclaimed);
        assert_eq!(correlator.pending(), 1);

        correlator.fail_all("test over");
        assert!(waiting.await.unwrap().is_err());
    }
}
