//! Error types for the CloudPlugs MQTT client
//!
//! Every public operation resolves to exactly one `ClientResult`. Transport
//! failures, correlation failures and input validation all share this enum so
//! callers can match on the failure kind without downcasting.

use crate::config::ConfigError;
use crate::correlator::RequestKind;
use crate::transport::mqtt::ConnectionState;
use thiserror::Error;

/// Main error type for client operations
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Authentication rejected: {message}")]
    Auth { message: String },

    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },

    #[error("Connect already in progress")]
    AlreadyConnecting,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("No response to {kind} request within {timeout_ms}ms")]
    Timeout { kind: RequestKind, timeout_ms: u64 },

    #[error("Malformed response: {message}")]
    Protocol { message: String },

    #[error("Invalid input: {message}")]
    Validation { message: String },

    #[error("Enrollment already in progress for hardware id {hwid}")]
    AlreadyEnrolling { hwid: String },

    #[error("Request rejected by platform: {message}")]
    Rejected { code: Option<i64>, message: String },

    #[error("Broker refused subscription to {topic}")]
    SubscriptionRejected { topic: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error")]
    Serialization(#[source] serde_json::Error),
}

impl ClientError {
    /// Create connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create authentication error
    pub fn auth<S: Into<String>>(message: S) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Create protocol (malformed response) error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn subscription_rejected<S: Into<String>>(topic: S) -> Self {
        Self::SubscriptionRejected {
            topic: topic.into(),
        }
    }

    pub fn not_connected(state: ConnectionState) -> Self {
        Self::NotConnected { state }
    }

    /// True for failures of the session itself rather than of one operation
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            ClientError::Connection { .. } | ClientError::Auth { .. }
        )
    }
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_constructor() {
        let error = ClientError::validation("plug id is empty");
        assert!(matches!(error, ClientError::Validation { .. }));
        assert_eq!(error.to_string(), "Invalid input: plug id is empty");
    }

    #[test]
    fn test_protocol_constructor() {
        let error = ClientError::protocol("missing field `value`");
        assert!(matches!(error, ClientError::Protocol { .. }));
        assert_eq!(error.to_string(), "Malformed response: missing field `value`");
    }

    #[test]
    fn test_timeout_display_names_request_kind() {
        let error = ClientError::Timeout {
            kind: RequestKind::GetProperty,
            timeout_ms: 250,
        };
        let text = error.to_string();
        assert!(text.contains("get-property"));
        assert!(text.contains("250ms"));
    }

    #[test]
    fn test_not_connected_reports_state() {
        let error = ClientError::not_connected(ConnectionState::Disconnected);
        assert!(error.to_string().contains("Disconnected"));
    }

    #[test]
    fn test_subscription_rejected_names_filter() {
        let error = ClientError::subscription_rejected("dev-1/data/#");
        assert!(!error.is_transport_failure());
        assert_eq!(error.to_string(), "Broker refused subscription to dev-1/data/#");
    }

    #[test]
    fn test_transport_failure_classification() {
        assert!(ClientError::connection("reset").is_transport_failure());
        assert!(ClientError::auth("bad password").is_transport_failure());
        assert!(!ClientError::AlreadyConnected.is_transport_failure());
        assert!(!ClientError::AlreadyEnrolling {
            hwid: "hw-1".to_string()
        }
        .is_transport_failure());
    }

    #[test]
    fn test_config_error_conversion() {
        let error: ClientError = ConfigError::InvalidConfig("qos must be 0, 1 or 2".into()).into();
        assert!(matches!(error, ClientError::Config(_)));
        assert!(error.to_string().contains("qos"));
    }
}
