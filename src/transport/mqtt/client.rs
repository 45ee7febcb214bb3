//! Impure I/O operations for the MQTT transport
//!
//! This module owns the rumqttc `AsyncClient`, drives its `EventLoop` on a
//! background task and turns CONNACKs, publishes and event loop errors into
//! state transitions and `InboundHandler` callbacks. `subscribe` completes
//! only once the broker's SUBACK for it has arrived.

use super::connection::{
    can_publish, check_can_connect, configure_mqtt_options, determine_next_state, ConnectionEvent,
    ConnectionState,
};
use super::message_handler::{EventRoute, MessageHandler};
use super::suback::SubAckTracker;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::transport::{InboundHandler, Transport};
use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, QoS};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the rumqttc request channel between `AsyncClient` and `EventLoop`
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// How long `disconnect` waits for the event loop task before aborting it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type ConnectOutcome = Result<(), ClientError>;

/// One broker session: the request handle plus the task polling its event loop
struct Session {
    client: AsyncClient,
    event_loop_handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    acks: Arc<SubAckTracker>,
    ack_timeout: Duration,
}

/// Withdraws a queued SUBACK waiter whose SUBSCRIBE never reached the request channel
struct QueuedWaiter<'a> {
    acks: Option<&'a SubAckTracker>,
}

impl QueuedWaiter<'_> {
    fn handed_over(mut self) {
        self.acks = None;
    }
}

impl Drop for QueuedWaiter<'_> {
    fn drop(&mut self) {
        if let Some(acks) = self.acks {
            acks.withdraw_last();
        }
    }
}

/// rumqttc-backed implementation of [`Transport`]
///
/// A fresh `AsyncClient`/`EventLoop` pair is built for every `connect`, so
/// the same transport can be reused after a disconnect or a lost session.
pub struct MqttTransport {
    session: Mutex<Option<Session>>,
    // Keeps SUBACK waiters queued in the order their SUBSCRIBEs are sent
    subscribe_order: tokio::sync::Mutex<()>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl MqttTransport {
    pub fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            session: Mutex::new(None),
            subscribe_order: tokio::sync::Mutex::new(()),
            state_tx: Arc::new(state_tx),
            state_rx,
        }
    }

    /// Watch connection state changes
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Raw rumqttc handle of the current session, if one exists
    ///
    /// Subscribing through this handle bypasses SUBACK tracking; do not mix
    /// it with concurrent [`Transport::subscribe`] calls.
    pub fn session(&self) -> Option<AsyncClient> {
        self.lock_session()
            .as_ref()
            .map(|session| session.client.clone())
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(state_tx: &watch::Sender<ConnectionState>, event: ConnectionEvent) {
        state_tx.send_modify(|state| *state = determine_next_state(*state, &event));
    }

    /// Claim the `Connecting` state, refusing if a session is already in flight
    fn claim_connecting(&self) -> Result<(), ClientError> {
        let mut claim = Ok(());
        self.state_tx.send_if_modified(|state| match check_can_connect(*state) {
            Ok(()) => {
                *state = determine_next_state(*state, &ConnectionEvent::ConnectRequested);
                true
            }
            Err(e) => {
                claim = Err(e);
                false
            }
        });
        claim
    }

    /// Client handle for an operation that needs an established session
    fn active_client(&self) -> Result<AsyncClient, ClientError> {
        let state = *self.state_rx.borrow();
        if !can_publish(state) {
            return Err(ClientError::not_connected(state));
        }
        self.session()
            .ok_or_else(|| ClientError::not_connected(ConnectionState::Disconnected))
    }

    /// Client handle and SUBACK tracker of the current session
    fn active_subscriber(&self) -> Result<(AsyncClient, Arc<SubAckTracker>, Duration), ClientError> {
        let state = *self.state_rx.borrow();
        if !can_publish(state) {
            return Err(ClientError::not_connected(state));
        }
        self.lock_session()
            .as_ref()
            .map(|session| {
                (
                    session.client.clone(),
                    Arc::clone(&session.acks),
                    session.ack_timeout,
                )
            })
            .ok_or_else(|| ClientError::not_connected(ConnectionState::Disconnected))
    }

    /// Wait for the broker's verdict on one SUBSCRIBE
    async fn wait_for_suback(
        topic: &str,
        granted_rx: oneshot::Receiver<bool>,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        match tokio::time::timeout(timeout, granted_rx).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(ClientError::subscription_rejected(topic)),
            Ok(Err(_)) => Err(ClientError::connection(format!(
                "session ended before subscription to {topic} was acknowledged"
            ))),
            Err(_) => Err(ClientError::connection(format!(
                "SubAck timeout - no acknowledgement for {topic} within {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Wait for the event loop to report the CONNACK outcome
    async fn wait_for_connection_confirmation(
        outcome_rx: oneshot::Receiver<ConnectOutcome>,
        timeout: Duration,
    ) -> ConnectOutcome {
        match tokio::time::timeout(timeout, outcome_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ClientError::connection(
                "event loop stopped before the connection was confirmed",
            )),
            Err(_) => Err(ClientError::connection(format!(
                "ConnAck timeout - no connection confirmation within {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Poll the event loop until shutdown, an explicit disconnect or the first error
    async fn run_event_loop(
        mut event_loop: EventLoop,
        handler: Arc<dyn InboundHandler>,
        state_tx: Arc<watch::Sender<ConnectionState>>,
        acks: Arc<SubAckTracker>,
        mut shutdown_rx: watch::Receiver<bool>,
        outcome_tx: oneshot::Sender<ConnectOutcome>,
    ) {
        let mut outcome_tx = Some(outcome_tx);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Shutdown signal received, stopping MQTT event loop");
                        break;
                    }
                }

                event = event_loop.poll() => match event {
                    Ok(event) => {
                        let route = MessageHandler::route_mqtt_event(&event);
                        if !Self::process_event_route(route, &handler, &state_tx, &acks, &mut outcome_tx) {
                            break;
                        }
                    }
                    Err(e) => {
                        if *state_tx.borrow() == ConnectionState::Disconnecting {
                            debug!("Event loop closed after disconnect: {}", e);
                            break;
                        }
                        let reason = MessageHandler::classify_connection_error(&e);
                        Self::end_session(reason, &handler, &state_tx, &mut outcome_tx);
                        break;
                    }
                }
            }
        }

        acks.clear();
        debug!("MQTT event loop stopped");
    }

    /// Process one routed event; returns false when the loop must stop
    fn process_event_route(
        route: EventRoute,
        handler: &Arc<dyn InboundHandler>,
        state_tx: &watch::Sender<ConnectionState>,
        acks: &SubAckTracker,
        outcome_tx: &mut Option<oneshot::Sender<ConnectOutcome>>,
    ) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                Self::transition(state_tx, ConnectionEvent::ConnAckReceived);
                if let Some(tx) = outcome_tx.take() {
                    let _ = tx.send(Ok(()));
                }
                true
            }
            EventRoute::ConnectionRefused(kind) => {
                Self::end_session(kind.into(), handler, state_tx, outcome_tx);
                false
            }
            EventRoute::MessageReceived(message) => {
                debug!(target: "mqtt_transport", "Received MQTT message on topic: {}", message.topic);
                handler.on_message(message);
                true
            }
            EventRoute::Disconnected => {
                if *state_tx.borrow() == ConnectionState::Disconnecting {
                    return false;
                }
                let reason = ClientError::connection("broker closed the session");
                Self::end_session(reason, handler, state_tx, outcome_tx);
                false
            }
            EventRoute::SubscribeSent { packet_id } => {
                acks.sent(packet_id);
                true
            }
            EventRoute::SubscriptionConfirmed { packet_id, granted } => {
                let ok = match MessageHandler::validate_subscription_success(&granted) {
                    Ok(()) => {
                        debug!(target: "mqtt_transport", "Subscription {} confirmed", packet_id);
                        true
                    }
                    Err(e) => {
                        warn!("Subscription {} not granted: {}", packet_id, e);
                        false
                    }
                };
                acks.acknowledged(packet_id, ok);
                true
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    /// A connect attempt fails through its waiter; an established session reports loss
    fn end_session(
        reason: ClientError,
        handler: &Arc<dyn InboundHandler>,
        state_tx: &watch::Sender<ConnectionState>,
        outcome_tx: &mut Option<oneshot::Sender<ConnectOutcome>>,
    ) {
        match outcome_tx.take() {
            Some(tx) => {
                Self::transition(state_tx, ConnectionEvent::ConnectFailed(reason.to_string()));
                let _ = tx.send(Err(reason));
            }
            None => {
                error!("MQTT session lost: {}", reason);
                Self::transition(state_tx, ConnectionEvent::ConnectionLost(reason.to_string()));
                handler.on_connection_lost(&reason);
            }
        }
    }

    /// Stop a session's event loop task, waiting briefly for a clean exit
    async fn shutdown_session(session: Session) {
        let Session {
            event_loop_handle: mut handle,
            shutdown_tx,
            ..
        } = session;

        match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
            Ok(Ok(())) => info!("Event loop task shut down gracefully"),
            Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!("Event loop task didn't shut down gracefully, forcing abort");
                let _ = shutdown_tx.send(true);
                handle.abort();
            }
        }
    }
}

impl Default for MqttTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(
        &self,
        config: &ClientConfig,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<(), ClientError> {
        self.claim_connecting()?;

        let mqtt_options = match configure_mqtt_options(config) {
            Ok(options) => options,
            Err(e) => {
                Self::transition(&self.state_tx, ConnectionEvent::ConnectFailed(e.to_string()));
                return Err(e);
            }
        };
        info!(
            host = %config.broker.host,
            port = config.broker.effective_port(),
            tls = config.broker.tls,
            "Connecting to MQTT broker"
        );

        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let acks = Arc::new(SubAckTracker::new());

        let event_loop_handle = tokio::spawn(Self::run_event_loop(
            event_loop,
            handler,
            Arc::clone(&self.state_tx),
            Arc::clone(&acks),
            shutdown_rx,
            outcome_tx,
        ));

        // A previous session that was lost is replaced here; its task has already exited
        let previous = self.lock_session().replace(Session {
            client,
            event_loop_handle,
            shutdown_tx,
            acks,
            ack_timeout: config.broker.connect_timeout(),
        });
        if let Some(previous) = previous {
            previous.event_loop_handle.abort();
        }

        let outcome =
            Self::wait_for_connection_confirmation(outcome_rx, config.broker.connect_timeout())
                .await;

        if let Err(e) = &outcome {
            if let Some(session) = self.lock_session().take() {
                let _ = session.shutdown_tx.send(true);
                session.event_loop_handle.abort();
            }
            self.state_tx.send_if_modified(|state| {
                if *state == ConnectionState::Disconnected {
                    return false;
                }
                *state = determine_next_state(*state, &ConnectionEvent::ConnectFailed(e.to_string()));
                true
            });
        }

        outcome
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        let mut proceed = false;
        self.state_tx.send_if_modified(|state| match state {
            ConnectionState::Disconnected | ConnectionState::Disconnecting => false,
            _ => {
                *state = determine_next_state(*state, &ConnectionEvent::DisconnectRequested);
                proceed = true;
                true
            }
        });
        if !proceed {
            debug!("Disconnect requested while not connected");
            return Ok(());
        }

        let session = self.lock_session().take();
        if let Some(session) = session {
            if let Err(e) = session.client.disconnect().await {
                debug!("DISCONNECT could not be queued: {}", e);
            }
            Self::shutdown_session(session).await;
        }

        Self::transition(&self.state_tx, ConnectionEvent::SessionClosed);
        info!("MQTT transport disconnected");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), ClientError> {
        let client = self.active_client()?;
        client
            .publish(topic, qos, false, payload)
            .await
            .map_err(|e| ClientError::connection(format!("publish to {topic} failed: {e}")))
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), ClientError> {
        let (client, acks, ack_timeout) = self.active_subscriber()?;

        let granted_rx = {
            let _order = self.subscribe_order.lock().await;
            let granted_rx = acks.enqueue();
            let queued = QueuedWaiter { acks: Some(&acks) };
            client
                .subscribe(topic, qos)
                .await
                .map_err(|e| ClientError::connection(format!("subscribe to {topic} failed: {e}")))?;
            queued.handed_over();
            granted_rx
        };

        Self::wait_for_suback(topic, granted_rx, ack_timeout).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), ClientError> {
        let client = self.active_client()?;
        client
            .unsubscribe(topic)
            .await
            .map_err(|e| ClientError::connection(format!("unsubscribe from {topic} failed: {e}")))
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        // Async disconnect is impossible here; only stop the background task
        if let Some(session) = self.lock_session().take() {
            let _ = session.shutdown_tx.send(true);
            session.event_loop_handle.abort();
        }
    }
}
