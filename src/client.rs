//! CloudPlugs client facade
//!
//! [`CloudPlugsClient`] is the public entry point. It owns the configuration
//! snapshot, the transport, the correlator and the dispatcher, and exposes
//! every platform operation as one `async fn` returning one `ClientResult`.

use crate::config::ClientConfig;
use crate::correlator::{CorrelatedRequest, Correlator};
use crate::dispatcher::{ChannelSink, MessageDispatcher, MessageSink, SinkEvent};
use crate::error::{ClientError, ClientResult};
use crate::protocol::{DataRecord, EnrollCredentials, Reply, TopicBuilder};
use crate::transport::mqtt::connection::{check_can_connect, provisional_config, qos_from_level};
use crate::transport::{ConnectionState, InboundHandler, InboundMessage, MqttTransport, Transport};
use rumqttc::QoS;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{mpsc, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Per-call overrides for [`CloudPlugsClient::publish_with`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    /// Seconds the platform keeps the record; falls back to `session.default_ttl_secs`
    pub ttl: Option<u32>,
    /// Publish on behalf of another plug
    pub plug_id_of: Option<String>,
}

/// Per-call overrides for [`CloudPlugsClient::subscribe_with`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscribeOptions {
    /// Scope the filter under `{plug}/data/`; falls back to `session.subscribe_with_prefix`
    pub prefix: Option<bool>,
    /// Plug whose data to subscribe to; defaults to the own plug id
    pub plug_id: Option<String>,
}

type SubscriptionSet = Arc<Mutex<HashSet<String>>>;

/// Handler installed on the transport for one session
struct SessionHandler {
    dispatcher: Arc<MessageDispatcher>,
    subscriptions: SubscriptionSet,
    persistence: bool,
}

impl InboundHandler for SessionHandler {
    fn on_message(&self, message: InboundMessage) {
        self.dispatcher.on_message(message);
    }

    fn on_connection_lost(&self, error: &ClientError) {
        if !self.persistence {
            self.subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
        self.dispatcher.on_connection_lost(error);
    }
}

/// An open provisional enrollment session
///
/// Closed by [`close`](Self::close) on the normal path. When the enrollment
/// future is dropped instead, `Drop` closes it on a spawned task. The session
/// gate is held until the transport is disconnected, so `connect` cannot
/// interleave with the teardown.
struct ProvisionalSession<T: Transport + 'static> {
    transport: Arc<T>,
    provisional: Arc<AtomicBool>,
    hwid: String,
    gate: Option<OwnedMutexGuard<()>>,
}

impl<T: Transport + 'static> ProvisionalSession<T> {
    async fn close(mut self) {
        let gate = self.gate.take();
        close_provisional(&*self.transport, &self.provisional, &self.hwid).await;
        drop(gate);
    }
}

impl<T: Transport + 'static> Drop for ProvisionalSession<T> {
    fn drop(&mut self) {
        let Some(gate) = self.gate.take() else {
            return;
        };
        warn!(hwid = %self.hwid, "Enrollment cancelled; closing provisional session");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let transport = Arc::clone(&self.transport);
                let provisional = Arc::clone(&self.provisional);
                let hwid = std::mem::take(&mut self.hwid);
                runtime.spawn(async move {
                    close_provisional(&*transport, &provisional, &hwid).await;
                    drop(gate);
                });
            }
            Err(_) => self.provisional.store(false, Ordering::SeqCst),
        }
    }
}

async fn close_provisional<T: Transport>(transport: &T, provisional: &AtomicBool, hwid: &str) {
    if let Err(e) = transport.disconnect().await {
        warn!(hwid = %hwid, "Closing provisional enrollment session failed: {}", e);
    }
    provisional.store(false, Ordering::SeqCst);
    debug!(hwid = %hwid, "Provisional enrollment session closed");
}

/// Device-facing client for the CloudPlugs platform
pub struct CloudPlugsClient<T: Transport + 'static = MqttTransport> {
    config: RwLock<Arc<ClientConfig>>,
    transport: Arc<T>,
    correlator: Arc<Correlator>,
    dispatcher: Arc<MessageDispatcher>,
    subscriptions: SubscriptionSet,
    // Serializes provisional enrollment sessions with connect and disconnect
    enrollment_session: Arc<tokio::sync::Mutex<()>>,
    provisional: Arc<AtomicBool>,
}

impl CloudPlugsClient<MqttTransport> {
    /// Client over the rumqttc transport
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        Self::with_transport(config, MqttTransport::new())
    }
}

impl<T: Transport + 'static> CloudPlugsClient<T> {
    /// Client over any transport, e.g. a mock in tests
    pub fn with_transport(config: ClientConfig, transport: T) -> ClientResult<Self> {
        config.validate()?;

        let transport = Arc::new(transport);
        let shared: Arc<dyn Transport> = transport.clone();
        let correlator = Arc::new(Correlator::new(shared));
        let dispatcher = Arc::new(MessageDispatcher::new(correlator.clone()));

        Ok(Self {
            config: RwLock::new(Arc::new(config)),
            transport,
            correlator,
            dispatcher,
            subscriptions: Arc::new(Mutex::new(HashSet::new())),
            enrollment_session: Arc::new(tokio::sync::Mutex::new(())),
            provisional: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> Arc<ClientConfig> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// State of the user session; a provisional enrollment session reads as disconnected
    pub fn connection_state(&self) -> ConnectionState {
        if self.provisional.load(Ordering::SeqCst) {
            return ConnectionState::Disconnected;
        }
        self.transport.connection_state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Underlying transport, for raw session access
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Number of correlated requests still waiting for a reply
    pub fn pending_requests(&self) -> usize {
        self.correlator.pending()
    }

    /// Topic filters subscribed through this client
    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        topics.sort();
        topics
    }

    /// Change the configuration; only allowed while disconnected
    pub fn update_config<F>(&self, update: F) -> ClientResult<()>
    where
        F: FnOnce(&mut ClientConfig),
    {
        check_can_connect(self.connection_state())?;

        let mut guard = self.config.write().unwrap_or_else(PoisonError::into_inner);
        let mut config = ClientConfig::clone(&guard);
        update(&mut config);
        config.validate()?;
        *guard = Arc::new(config);
        Ok(())
    }

    /// Set plug id, password and optionally the client (serial) id
    pub fn set_credentials(
        &self,
        plug_id: &str,
        password: &str,
        client_id: Option<&str>,
    ) -> ClientResult<()> {
        self.update_config(|config| {
            config.device.plug_id = Some(plug_id.to_string());
            config.device.password = Some(password.to_string());
            config.device.password_env = None;
            if let Some(client_id) = client_id {
                config.device.client_id = Some(client_id.to_string());
            }
        })
    }

    /// Adopt the credentials issued by a successful enrollment
    pub fn apply_enrollment(&self, credentials: &EnrollCredentials) -> ClientResult<()> {
        self.set_credentials(&credentials.plug_id, &credentials.auth, None)
    }

    /// Install the sink for messages that are not correlated replies
    pub fn set_message_sink(&self, sink: Arc<dyn MessageSink>) {
        self.dispatcher.set_sink(sink);
    }

    pub fn clear_message_sink(&self) {
        self.dispatcher.clear_sink();
    }

    /// Replace the sink with a channel and return its receiving end
    pub fn message_channel(&self) -> mpsc::UnboundedReceiver<SinkEvent> {
        let (sink, receiver) = ChannelSink::channel();
        self.dispatcher.set_sink(Arc::new(sink));
        receiver
    }

    fn session_handler(&self, config: &ClientConfig) -> Arc<dyn InboundHandler> {
        Arc::new(SessionHandler {
            dispatcher: self.dispatcher.clone(),
            subscriptions: self.subscriptions.clone(),
            persistence: config.session.persistence,
        })
    }

    /// Configuration snapshot for an operation that needs the user session
    fn require_connected(&self) -> ClientResult<Arc<ClientConfig>> {
        let state = self.connection_state();
        if state != ConnectionState::Connected {
            return Err(ClientError::not_connected(state));
        }
        Ok(self.config())
    }

    fn own_plug_id(config: &ClientConfig) -> ClientResult<&str> {
        config
            .plug_id()
            .ok_or_else(|| ClientError::validation("no plug id configured; enroll first"))
    }

    fn qos(config: &ClientConfig) -> ClientResult<QoS> {
        qos_from_level(config.session.qos)
    }

    /// Open the session with the configured credentials
    ///
    /// Waits for a provisional enrollment session to close first.
    pub async fn connect(&self) -> ClientResult<()> {
        let _gate = self.enrollment_session.lock().await;
        let config = self.config();
        check_can_connect(self.transport.connection_state())?;

        info!(
            host = %config.broker.host,
            plug_id = config.plug_id().unwrap_or("<anonymous>"),
            "Connecting CloudPlugs client"
        );
        let handler = self.session_handler(&config);
        self.transport.connect(&config, handler).await
    }

    /// Close the session; pending requests resolve by their own timeout
    pub async fn disconnect(&self) -> ClientResult<()> {
        let _gate = self.enrollment_session.lock().await;
        self.transport.disconnect().await?;
        if !self.config().session.persistence {
            self.subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
        info!("CloudPlugs client disconnected");
        Ok(())
    }

    /// Publish a data record on the own plug's `data/{topic}`
    pub async fn publish(&self, topic: &str, message: &str) -> ClientResult<()> {
        self.publish_with(topic, message, PublishOptions::default())
            .await
    }

    pub async fn publish_with(
        &self,
        topic: &str,
        message: &str,
        options: PublishOptions,
    ) -> ClientResult<()> {
        let config = self.require_connected()?;

        let plug_of = match options.plug_id_of.as_deref() {
            Some(plug_id) => plug_id,
            None => Self::own_plug_id(&config)?,
        };
        let full_topic = TopicBuilder::build_data_topic(topic, plug_of)?;
        let ttl = options.ttl.or(config.session.default_ttl_secs);
        let payload = DataRecord::from_message(message, ttl).to_payload()?;

        if config.session.log_enabled {
            info!(topic = %full_topic, ttl = ?ttl, "Publishing data record");
        } else {
            debug!(topic = %full_topic, "Publishing data record");
        }
        self.transport
            .publish(&full_topic, payload, Self::qos(&config)?)
            .await
    }

    /// Subscribe with the configured prefix policy; returns the filter actually used
    pub async fn subscribe(&self, topic: &str) -> ClientResult<String> {
        self.subscribe_with(topic, SubscribeOptions::default()).await
    }

    pub async fn subscribe_with(
        &self,
        topic: &str,
        options: SubscribeOptions,
    ) -> ClientResult<String> {
        let config = self.require_connected()?;
        let filter = Self::subscription_filter(&config, topic, &options)?;

        if config.session.log_enabled {
            info!(filter = %filter, "Subscribing");
        }
        self.transport
            .subscribe(&filter, Self::qos(&config)?)
            .await?;
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(filter.clone());
        Ok(filter)
    }

    /// Undo a [`subscribe`](Self::subscribe); a topic never subscribed is a no-op
    pub async fn unsubscribe(&self, topic: &str) -> ClientResult<()> {
        self.unsubscribe_with(topic, SubscribeOptions::default())
            .await
    }

    /// Undo a subscription to another plug's data
    pub async fn unsubscribe_from(&self, plug_id: &str, topic: &str) -> ClientResult<()> {
        let options = SubscribeOptions {
            prefix: Some(true),
            plug_id: Some(plug_id.to_string()),
        };
        self.unsubscribe_with(topic, options).await
    }

    pub async fn unsubscribe_with(
        &self,
        topic: &str,
        options: SubscribeOptions,
    ) -> ClientResult<()> {
        let config = self.require_connected()?;
        let filter = Self::subscription_filter(&config, topic, &options)?;

        let known = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&filter);
        if !known {
            debug!(filter = %filter, "Unsubscribe from a filter that was never subscribed");
            return Ok(());
        }

        if config.session.log_enabled {
            info!(filter = %filter, "Unsubscribing");
        }
        if let Err(e) = self.transport.unsubscribe(&filter).await {
            self.subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(filter);
            return Err(e);
        }
        Ok(())
    }

    fn subscription_filter(
        config: &ClientConfig,
        topic: &str,
        options: &SubscribeOptions,
    ) -> ClientResult<String> {
        let prefix = options
            .prefix
            .unwrap_or(config.session.subscribe_with_prefix);
        let plug_id = options.plug_id.as_deref().or(config.plug_id());
        Ok(TopicBuilder::build_subscribe_topic(topic, prefix, plug_id)?)
    }

    /// Read a property of the own plug
    pub async fn get_property(&self, key: &str) -> ClientResult<Value> {
        let config = self.require_connected()?;
        let plug_id = Self::own_plug_id(&config)?.to_string();
        self.get_property_of(&plug_id, key).await
    }

    /// Read a property of any plug the device may access
    pub async fn get_property_of(&self, plug_id: &str, key: &str) -> ClientResult<Value> {
        let config = self.require_connected()?;
        let request = CorrelatedRequest::get_property(
            plug_id,
            key,
            Self::qos(&config)?,
            config.session.request_timeout(),
        )?;

        if config.session.log_enabled {
            info!(plug_id = %plug_id, key = %key, "Reading property");
        }
        match self.correlator.execute(request).await? {
            Reply::Value(value) => Ok(value),
            other => Err(ClientError::protocol(format!(
                "unexpected reply to get-property: {other:?}"
            ))),
        }
    }

    /// Write a property of the own plug
    pub async fn set_property(&self, key: &str, value: Value) -> ClientResult<()> {
        let config = self.require_connected()?;
        let plug_id = Self::own_plug_id(&config)?.to_string();
        self.set_property_of(&plug_id, key, value).await
    }

    /// Write a property of any plug the device may access
    pub async fn set_property_of(&self, plug_id: &str, key: &str, value: Value) -> ClientResult<()> {
        let config = self.require_connected()?;
        let request = CorrelatedRequest::set_property(
            plug_id,
            key,
            value,
            Self::qos(&config)?,
            config.session.request_timeout(),
        )?;

        if config.session.log_enabled {
            info!(plug_id = %plug_id, key = %key, "Writing property");
        }
        match self.correlator.execute(request).await? {
            Reply::Ack => Ok(()),
            other => Err(ClientError::protocol(format!(
                "unexpected reply to set-property: {other:?}"
            ))),
        }
    }

    /// Enroll this device; works with or without a connected session
    pub async fn enroll(
        &self,
        hwid: &str,
        model_id: &str,
        password: &str,
    ) -> ClientResult<EnrollCredentials> {
        let config = self.config();
        let request = CorrelatedRequest::enroll(
            hwid,
            model_id,
            password,
            Self::qos(&config)?,
            config.session.request_timeout(),
        )?;
        self.run_enrollment(hwid, request).await
    }

    /// Enroll a device through its controller `ctrl_hwid`
    pub async fn enroll_ctrl(
        &self,
        hwid: &str,
        model_id: &str,
        ctrl_hwid: &str,
        password: &str,
    ) -> ClientResult<EnrollCredentials> {
        let config = self.config();
        let request = CorrelatedRequest::enroll_ctrl(
            hwid,
            model_id,
            ctrl_hwid,
            password,
            Self::qos(&config)?,
            config.session.request_timeout(),
        )?;
        self.run_enrollment(hwid, request).await
    }

    async fn run_enrollment(
        &self,
        hwid: &str,
        request: CorrelatedRequest,
    ) -> ClientResult<EnrollCredentials> {
        let _claim = self.correlator.table().claim_enrollment(hwid)?;
        info!(hwid = %hwid, kind = %request.kind, "Enrolling device");

        let reply = if self.is_connected() {
            self.correlator.execute(request).await?
        } else {
            self.enroll_in_provisional_session(hwid, request).await?
        };

        match reply {
            Reply::Enrolled(credentials) => {
                info!(hwid = %hwid, plug_id = %credentials.plug_id, "Device enrolled");
                Ok(credentials)
            }
            other => Err(ClientError::protocol(format!(
                "unexpected reply to enrollment: {other:?}"
            ))),
        }
    }

    /// Run one enrollment over a short-lived anonymous session
    async fn enroll_in_provisional_session(
        &self,
        hwid: &str,
        request: CorrelatedRequest,
    ) -> ClientResult<Reply> {
        let gate = Arc::clone(&self.enrollment_session).lock_owned().await;

        // The user may have connected while this call waited for the gate
        match self.transport.connection_state() {
            ConnectionState::Connected => return self.correlator.execute(request).await,
            ConnectionState::Disconnected => {}
            state => return Err(ClientError::not_connected(state)),
        }

        let config = provisional_config(&self.config(), hwid);
        debug!(hwid = %hwid, "Opening provisional enrollment session");
        self.provisional.store(true, Ordering::SeqCst);
        let session = ProvisionalSession {
            transport: Arc::clone(&self.transport),
            provisional: Arc::clone(&self.provisional),
            hwid: hwid.to_string(),
            gate: Some(gate),
        };

        let outcome = match self
            .transport
            .connect(&config, self.session_handler(&config))
            .await
        {
            Ok(()) => self.correlator.execute(request).await,
            Err(e) => Err(e),
        };

        session.close().await;
        outcome
    }
}
