//! Configuration for the realtime messaging core
//!
//! Loaded from TOML. Every wire-format string used by the RPC and presence
//! protocols lives in [`WireNames`], because the exact strings have changed
//! between backend deployments.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use url::Url;

/// Top-level SDK configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SdkConfig {
    pub mqtt: MqttSection,
    #[serde(default)]
    pub backoff: BackoffSection,
    pub presence: Option<PresenceSection>,
    #[serde(default)]
    pub wire: WireNames,
}

/// MQTT broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL with protocol and port (mqtt:// or mqtts://)
    pub broker_url: String,
    /// Prefix for the generated client id
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    /// Username sent alongside the token password
    #[serde(default)]
    pub username: String,
    /// Keep alive in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Reconnect attempts before a terminal disconnect
    #[serde(default = "default_reconnect_limit")]
    pub reconnect_limit: u32,
    /// Maximum packet size in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,
    /// Sent as the `connection_mode` CONNECT user property
    #[serde(default = "default_connection_mode")]
    pub connection_mode: String,
    /// Sent as the `connection_version` CONNECT user property
    #[serde(default = "default_connection_version")]
    pub connection_version: String,
}

fn default_client_id_prefix() -> String {
    "ulms".to_string()
}

fn default_keep_alive() -> u64 {
    10
}

fn default_reconnect_limit() -> u32 {
    3
}

fn default_max_packet_size() -> u32 {
    256 * 1024
}

fn default_connection_mode() -> String {
    "default".to_string()
}

fn default_connection_version() -> String {
    "v2".to_string()
}

impl MqttSection {
    /// Section with defaults for everything but the broker URL
    pub fn new(broker_url: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            client_id_prefix: default_client_id_prefix(),
            username: String::new(),
            keep_alive_secs: default_keep_alive(),
            reconnect_limit: default_reconnect_limit(),
            max_packet_size: default_max_packet_size(),
            connection_mode: default_connection_mode(),
            connection_version: default_connection_version(),
        }
    }
}

/// Reconnect delay policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffSection {
    #[serde(default = "default_factor")]
    pub factor: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_random_additive_max_ms")]
    pub random_additive_max_ms: u64,
}

fn default_factor() -> u64 {
    2
}

fn default_max_delay_ms() -> u64 {
    5 * 60 * 1000
}

fn default_random_additive_max_ms() -> u64 {
    1000
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            factor: default_factor(),
            max_delay_ms: default_max_delay_ms(),
            random_additive_max_ms: default_random_additive_max_ms(),
        }
    }
}

/// Presence service settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceSection {
    /// WebSocket URL (ws:// or wss://)
    pub url: String,
    pub agent_label: Option<String>,
    pub classroom_id: Option<String>,
}

/// Wire-format names for both protocols
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WireNames {
    #[serde(default)]
    pub rpc: RpcWireNames,
    #[serde(default)]
    pub presence: PresenceWireNames,
}

/// MQTT user-property keys and message type values
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RpcWireNames {
    pub type_key: String,
    pub method_key: String,
    pub label_key: String,
    pub status_key: String,
    pub local_timestamp_key: String,
    pub request_type: String,
    pub response_type: String,
    pub event_type: String,
}

impl Default for RpcWireNames {
    fn default() -> Self {
        Self {
            type_key: "type".to_string(),
            method_key: "method".to_string(),
            label_key: "label".to_string(),
            status_key: "status".to_string(),
            local_timestamp_key: "local_timestamp".to_string(),
            request_type: "request".to_string(),
            response_type: "response".to_string(),
            event_type: "event".to_string(),
        }
    }
}

/// Presence frame types and payload field names
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PresenceWireNames {
    pub connect_request_type: String,
    pub connect_success_types: Vec<String>,
    pub event_type: String,
    pub error_type: String,
    pub token_field: String,
    pub idle_timeout_fields: Vec<String>,
    pub ping: String,
    pub pong: String,
}

impl Default for PresenceWireNames {
    fn default() -> Self {
        Self {
            connect_request_type: "connect_request".to_string(),
            connect_success_types: vec![
                "connect_success".to_string(),
                "connect_completed".to_string(),
            ],
            event_type: "event".to_string(),
            error_type: "error".to_string(),
            token_field: "token".to_string(),
            idle_timeout_fields: vec!["idle_timeout".to_string(), "ping_timeout".to_string()],
            ping: "2".to_string(),
            pong: "3".to_string(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SdkConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SdkConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_url(&self.mqtt.broker_url, &["mqtt", "mqtts"])?;

        if self.backoff.factor < 1 {
            return Err(ConfigError::InvalidConfig(
                "backoff.factor must be at least 1".to_string(),
            ));
        }

        if let Some(presence) = &self.presence {
            validate_url(&presence.url, &["ws", "wss"])?;
        }

        let presence_wire = &self.wire.presence;
        if presence_wire.ping.chars().count() != 1 || presence_wire.pong.chars().count() != 1 {
            return Err(ConfigError::InvalidConfig(
                "wire.presence.ping and wire.presence.pong must be single characters".to_string(),
            ));
        }
        if presence_wire.connect_success_types.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "wire.presence.connect_success_types must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

fn validate_url(raw: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let url = Url::parse(raw)
        .map_err(|e| ConfigError::InvalidConfig(format!("Invalid URL '{raw}': {e}")))?;

    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::InvalidConfig(format!(
            "URL '{raw}' must use one of: {}",
            schemes.join(", ")
        )));
    }
    if url.host_str().is_none() {
        return Err(ConfigError::InvalidConfig(format!("URL '{raw}' has no host")));
    }

    Ok(())
}
