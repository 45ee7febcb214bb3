//! Pure connection state management for the MQTT transport
//!
//! This module contains pure functions for connection state transitions and
//! for turning a `ClientConfig` into rumqttc `MqttOptions`.

use crate::config::ClientConfig;
use crate::error::ClientError;
use rumqttc::Transport as RumqttcTransport;
use rumqttc::{MqttOptions, QoS, TlsConfiguration};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Connection state for the MQTT transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No session; the only state in which `connect` is accepted
    #[default]
    Disconnected,
    /// CONNECT sent, waiting for CONNACK
    Connecting,
    /// Session established and ready for operations
    Connected,
    /// Explicit disconnect in progress
    Disconnecting,
}

/// Events that drive state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    ConnectRequested,
    ConnAckReceived,
    /// Connect attempt failed before CONNACK
    ConnectFailed(String),
    DisconnectRequested,
    /// Explicit disconnect finished
    SessionClosed,
    /// Established session dropped by the broker or the network
    ConnectionLost(String),
}

/// Determine next state after connection event (pure function)
pub fn determine_next_state(current: ConnectionState, event: &ConnectionEvent) -> ConnectionState {
    match event {
        ConnectionEvent::ConnectRequested => ConnectionState::Connecting,
        ConnectionEvent::ConnAckReceived => {
            if current == ConnectionState::Connecting {
                info!("MQTT session established");
                ConnectionState::Connected
            } else {
                debug!("Ignoring CONNACK in state {:?}", current);
                current
            }
        }
        ConnectionEvent::ConnectFailed(reason) => {
            warn!("MQTT connect failed: {}", reason);
            ConnectionState::Disconnected
        }
        ConnectionEvent::DisconnectRequested => match current {
            ConnectionState::Disconnected => ConnectionState::Disconnected,
            _ => ConnectionState::Disconnecting,
        },
        ConnectionEvent::SessionClosed => {
            info!("MQTT session closed");
            ConnectionState::Disconnected
        }
        ConnectionEvent::ConnectionLost(reason) => {
            warn!("MQTT connection lost: {}", reason);
            ConnectionState::Disconnected
        }
    }
}

/// Reject re-entrant connects instead of queueing them (pure function)
pub fn check_can_connect(state: ConnectionState) -> Result<(), ClientError> {
    match state {
        ConnectionState::Disconnected => Ok(()),
        ConnectionState::Connecting => Err(ClientError::AlreadyConnecting),
        ConnectionState::Connected => Err(ClientError::AlreadyConnected),
        ConnectionState::Disconnecting => Err(ClientError::connection(
            "disconnect in progress; wait for it to finish before connecting",
        )),
    }
}

/// Check if connection state allows publishing and subscribing (pure function)
pub fn can_publish(state: ConnectionState) -> bool {
    matches!(state, ConnectionState::Connected)
}

/// Map a numeric QoS level onto rumqttc's enum
pub fn qos_from_level(level: u8) -> Result<QoS, ClientError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(ClientError::validation(format!(
            "QoS must be 0, 1 or 2 (got {other})"
        ))),
    }
}

/// Client id sent in CONNECT: configured serial, else plug id, else a random one
pub fn resolve_client_id(config: &ClientConfig) -> String {
    config
        .device
        .client_id
        .clone()
        .or_else(|| config.device.plug_id.clone())
        .unwrap_or_else(|| format!("cloudplugs-{}", Uuid::new_v4().simple()))
}

/// Pure function to configure MQTT options from config
pub fn configure_mqtt_options(config: &ClientConfig) -> Result<MqttOptions, ClientError> {
    config.validate()?;

    let client_id = resolve_client_id(config);
    if client_id.starts_with(char::is_whitespace) {
        return Err(ClientError::validation(format!(
            "client id '{client_id}' must not start with whitespace"
        )));
    }
    let mut mqtt_options = MqttOptions::new(
        client_id,
        config.broker.host.clone(),
        config.broker.effective_port(),
    );

    if config.broker.tls {
        let transport = if config.broker.allow_invalid_certificates {
            warn!("TLS certificate validation disabled for {}", config.broker.host);
            RumqttcTransport::Tls(TlsConfiguration::Rustls(Arc::new(
                insecure::client_config(),
            )))
        } else {
            RumqttcTransport::tls_with_default_config()
        };
        mqtt_options.set_transport(transport);
    }

    // The platform authenticates with plug id as username and the auth token as password
    if let Some(plug_id) = &config.device.plug_id {
        let password = config.device.password.clone().unwrap_or_default();
        mqtt_options.set_credentials(plug_id.clone(), password);
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.broker.keep_alive_secs.max(1)));
    mqtt_options.set_clean_session(!config.session.persistence);

    Ok(mqtt_options)
}

/// Enrollment runs before the device has credentials: anonymous, client id = hardware id
pub fn provisional_config(base: &ClientConfig, hwid: &str) -> ClientConfig {
    let mut config = base.clone();
    config.device.plug_id = None;
    config.device.password = None;
    config.device.password_env = None;
    config.device.client_id = Some(hwid.to_string());
    config.session.persistence = false;
    config
}

/// TLS configuration that accepts any server certificate
mod insecure {
    use rumqttc::tokio_rustls::rustls;
    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};
    use std::sync::Arc;

    #[derive(Debug)]
    struct AcceptAnyServerCert;

    impl ServerCertVerifier for AcceptAnyServerCert {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }

    pub(super) fn client_config() -> rustls::ClientConfig {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth()
    }
}
