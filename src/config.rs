//! Client configuration for the CloudPlugs MQTT client
//!
//! Configuration is split into three TOML sections: `[broker]` for the
//! endpoint, `[device]` for the identity the device connects with, and
//! `[session]` for per-session behaviour. Every section is optional; a missing
//! section takes its defaults.

use crate::protocol::topics::{validate_identity, IdentityKind};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Public CloudPlugs MQTT endpoint
pub const DEFAULT_HOST: &str = "api.cloudplugs.com";
pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_PORT_TLS: u16 = 8883;

/// Main client configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub device: DeviceSection,
    #[serde(default)]
    pub session: SessionSection,
}

/// Broker section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Broker host name
    #[serde(default = "default_host")]
    pub host: String,
    /// Broker port; defaults to 1883, or 8883 when `tls` is set
    pub port: Option<u16>,
    #[serde(default)]
    pub tls: bool,
    /// Trust servers with invalid or expired certificates
    #[serde(default)]
    pub allow_invalid_certificates: bool,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// How long `connect` waits for CONNACK
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Device identity section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// The device's plug id, used as MQTT username and default topic scope
    pub plug_id: Option<String>,
    /// The device's password/auth token
    pub password: Option<String>,
    /// Environment variable containing the password (used when `password` is unset)
    pub password_env: Option<String>,
    /// The device's client id (its serial number)
    pub client_id: Option<String>,
}

/// Session behaviour section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    /// MQTT QoS level for publishes and subscriptions (0, 1 or 2)
    #[serde(default = "default_qos")]
    pub qos: u8,
    /// Keep broker-side session state across connections (clean session off)
    #[serde(default)]
    pub persistence: bool,
    /// Log every publish/subscribe/request at info level
    #[serde(default)]
    pub log_enabled: bool,
    /// Deadline for correlated requests
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// TTL attached to publishes that don't specify one
    pub default_ttl_secs: Option<u32>,
    /// Whether `subscribe` scopes topics under the plug id by default
    #[serde(default = "default_subscribe_with_prefix")]
    pub subscribe_with_prefix: bool,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_qos() -> u8 {
    1
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_subscribe_with_prefix() -> bool {
    true
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
            tls: false,
            allow_invalid_certificates: false,
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            qos: default_qos(),
            persistence: false,
            log_enabled: false,
            request_timeout_ms: default_request_timeout_ms(),
            default_ttl_secs: None,
            subscribe_with_prefix: default_subscribe_with_prefix(),
        }
    }
}

impl BrokerSection {
    /// Parse `mqtt://host[:port]` or `mqtts://host[:port]`
    pub fn from_url(broker_url: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(broker_url)
            .map_err(|_| ConfigError::InvalidBrokerUrl(broker_url.to_string()))?;

        let tls = match url.scheme() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" => true,
            _ => return Err(ConfigError::InvalidBrokerUrl(broker_url.to_string())),
        };
        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::InvalidBrokerUrl(broker_url.to_string()))?;

        Ok(Self {
            host: host.to_string(),
            port: url.port(),
            tls,
            ..Self::default()
        })
    }

    /// Port to dial, falling back to the scheme default
    pub fn effective_port(&self) -> u16 {
        self.port
            .unwrap_or(if self.tls { DEFAULT_PORT_TLS } else { DEFAULT_PORT })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl SessionSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientConfig {
    /// Configuration for a device that already has its plug id and auth
    pub fn with_credentials<S: Into<String>>(plug_id: S, password: S) -> Self {
        let mut config = Self::default();
        config.device.plug_id = Some(plug_id.into());
        config.device.password = Some(password.into());
        config
    }

    /// Load configuration from TOML file with environment variable resolution
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: ClientConfig = toml::from_str(content)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Fill `device.password` from `device.password_env` when not set inline
    fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        if self.device.password.is_none() {
            if let Some(env_name) = &self.device.password_env {
                let password = std::env::var(env_name)
                    .map_err(|_| ConfigError::EnvVarNotFound(env_name.clone()))?;
                self.device.password = Some(password);
            }
        }
        Ok(())
    }

    /// Check ranges and identity formats
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker.host must not be empty".to_string(),
            ));
        }
        if self.broker.port == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "broker.port must be greater than 0".to_string(),
            ));
        }
        if self.broker.allow_invalid_certificates && !self.broker.tls {
            return Err(ConfigError::InvalidConfig(
                "broker.allow_invalid_certificates requires broker.tls".to_string(),
            ));
        }
        if self.session.qos > 2 {
            return Err(ConfigError::InvalidConfig(format!(
                "session.qos must be 0, 1 or 2 (got {})",
                self.session.qos
            )));
        }
        if self.session.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "session.request_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if let Some(plug_id) = &self.device.plug_id {
            validate_identity(plug_id, IdentityKind::PlugId)
                .map_err(|e| ConfigError::InvalidIdentity(e.to_string()))?;
        }
        if let Some(client_id) = &self.device.client_id {
            if client_id.is_empty() {
                return Err(ConfigError::InvalidIdentity(
                    "device.client_id must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Own plug id, if the device has been enrolled
    pub fn plug_id(&self) -> Option<&str> {
        self.device.plug_id.as_deref()
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[broker]
host = "localhost"

[device]
plug_id = "dev-0000000000000001"
password = "secret"
client_id = "SN-0001"

[session]
qos = 1
request_timeout_ms = 200
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}
