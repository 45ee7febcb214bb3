//! Inbound message dispatch
//!
//! Every message the transport delivers goes through [`MessageDispatcher`]:
//! replies to pending requests are consumed by the correlator, everything
//! else is handed to the application's [`MessageSink`] in arrival order.

use crate::correlator::{Correlator, Resolution};
use crate::error::ClientError;
use crate::transport::{InboundHandler, InboundMessage};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Application callback for messages that are not correlated replies
pub trait MessageSink: Send + Sync {
    fn on_message(&self, topic: &str, payload: &[u8], retained: bool);

    /// Called once when an established session drops
    fn on_connection_lost(&self, _error: &ClientError) {}
}

/// Events produced by [`ChannelSink`]
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Message(InboundMessage),
    ConnectionLost(String),
}

/// Sink that forwards into an unbounded channel
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::UnboundedSender<SinkEvent>) -> Self {
        Self { sender }
    }

    /// Sink plus the receiving end of its channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }
}

impl MessageSink for ChannelSink {
    fn on_message(&self, topic: &str, payload: &[u8], retained: bool) {
        let message = InboundMessage::new(topic, payload.to_vec(), retained);
        if self.sender.send(SinkEvent::Message(message)).is_err() {
            debug!(topic = %topic, "Message channel closed; dropping message");
        }
    }

    fn on_connection_lost(&self, error: &ClientError) {
        let _ = self.sender.send(SinkEvent::ConnectionLost(error.to_string()));
    }
}

/// What the dispatcher did with one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Resolved a pending request
    Correlated,
    /// Late reply for a finished request
    Discarded,
    /// Handed to the application sink
    Forwarded,
    /// No sink installed
    Dropped,
}

/// Routes inbound messages between the correlator and the application sink
pub struct MessageDispatcher {
    correlator: Arc<Correlator>,
    sink: RwLock<Option<Arc<dyn MessageSink>>>,
}

impl MessageDispatcher {
    pub fn new(correlator: Arc<Correlator>) -> Self {
        Self {
            correlator,
            sink: RwLock::new(None),
        }
    }

    /// Install the application sink, returning the previous one
    pub fn set_sink(&self, sink: Arc<dyn MessageSink>) -> Option<Arc<dyn MessageSink>> {
        self.sink
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(sink)
    }

    pub fn clear_sink(&self) -> Option<Arc<dyn MessageSink>> {
        self.sink
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn has_sink(&self) -> bool {
        self.current_sink().is_some()
    }

    fn current_sink(&self) -> Option<Arc<dyn MessageSink>> {
        self.sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn dispatch(&self, message: InboundMessage) -> DispatchOutcome {
        match self.correlator.resolve_inbound(&message) {
            Resolution::Resolved => return DispatchOutcome::Correlated,
            Resolution::Discarded => return DispatchOutcome::Discarded,
            Resolution::Unclaimed => {}
        }

        match self.current_sink() {
            Some(sink) => {
                sink.on_message(&message.topic, &message.payload, message.retained);
                DispatchOutcome::Forwarded
            }
            None => {
                trace!(topic = %message.topic, "No message sink installed; dropping message");
                DispatchOutcome::Dropped
            }
        }
    }
}

impl InboundHandler for MessageDispatcher {
    fn on_message(&self, message: InboundMessage) {
        self.dispatch(message);
    }

    fn on_connection_lost(&self, error: &ClientError) {
        self.correlator.fail_all(&error.to_string());
        if let Some(sink) = self.current_sink() {
            sink.on_connection_lost(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockTransport;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        messages: Mutex<Vec<(String, Vec<u8>, bool)>>,
        lost: Mutex<Vec<String>>,
    }

    impl MessageSink for RecordingSink {
        fn on_message(&self, topic: &str, payload: &[u8], retained: bool) {
            self.messages
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.to_vec(), retained));
        }

        fn on_connection_lost(&self, error: &ClientError) {
            self.lost.lock().unwrap().push(error.to_string());
        }
    }

    fn dispatcher() -> MessageDispatcher {
        let transport = Arc::new(MockTransport::connected());
        MessageDispatcher::new(Arc::new(Correlator::new(transport)))
    }

    #[test]
    fn test_forwards_in_arrival_order() {
        // Arrange
        let dispatcher = dispatcher();
        let sink = Arc::new(RecordingSink::default());
        dispatcher.set_sink(sink.clone());

        // Act
        for i in 0..3 {
            let outcome = dispatcher.dispatch(InboundMessage::new(
                format!("dev-1/data/t{i}"),
                format!("{i}"),
                false,
            ));
            assert_eq!(outcome, DispatchOutcome::Forwarded);
        }

        // Assert
        let topics: Vec<String> = sink
            .messages
            .lock()
            .unwrap()
            .iter()
            .map(|(topic, _, _)| topic.clone())
            .collect();
        assert_eq!(topics, vec!["dev-1/data/t0", "dev-1/data/t1", "dev-1/data/t2"]);
    }

    #[test]
    fn test_retained_flag_reaches_sink() {
        let dispatcher = dispatcher();
        let sink = Arc::new(RecordingSink::default());
        dispatcher.set_sink(sink.clone());

        dispatcher.dispatch(InboundMessage::new("dev-1/data/t", "x", true));

        assert!(sink.messages.lock().unwrap()[0].2);
    }

    #[test]
    fn test_drops_without_sink() {
        let dispatcher = dispatcher();
        assert!(!dispatcher.has_sink());
        assert_eq!(
            dispatcher.dispatch(InboundMessage::new("dev-1/data/t", "x", false)),
            DispatchOutcome::Dropped
        );
    }

    #[test]
    fn test_replace_and_clear_sink() {
        let dispatcher = dispatcher();
        let first = Arc::new(RecordingSink::default());
        let second = Arc::new(RecordingSink::default());

        assert!(dispatcher.set_sink(first.clone()).is_none());
        assert!(dispatcher.set_sink(second.clone()).is_some());
        dispatcher.dispatch(InboundMessage::new("dev-1/data/t", "x", false));

        assert!(first.messages.lock().unwrap().is_empty());
        assert_eq!(second.messages.lock().unwrap().len(), 1);

        assert!(dispatcher.clear_sink().is_some());
        assert!(!dispatcher.has_sink());
    }

    #[test]
    fn test_connection_lost_reaches_sink() {
        let dispatcher = dispatcher();
        let sink = Arc::new(RecordingSink::default());
        dispatcher.set_sink(sink.clone());

        dispatcher.on_connection_lost(&ClientError::connection("network down"));

        assert_eq!(sink.lost.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_channel_sink() {
        let (sink, mut receiver) = ChannelSink::channel();

        sink.on_message("dev-1/data/t", b"hello", false);
        sink.on_connection_lost(&ClientError::connection("gone"));

        assert_eq!(
            receiver.recv().await,
            Some(SinkEvent::Message(InboundMessage::new(
                "dev-1/data/t",
                "hello",
                false
            )))
        );
        assert!(matches!(
            receiver.recv().await,
            Some(SinkEvent::ConnectionLost(_))
        ));
    }
}
