//! Configuration system for the managed MQTT client
//!
//! Configuration is read from a TOML file and then merged with environment
//! overrides. Precedence is always: environment > file/passed config > built-in
//! default.
//!
//! ```toml
//! [mqtt]
//! broker_url = "mqtt://localhost:1883"
//! client_id = "bridge-1"
//! qos = 1
//!
//! [topics]
//! inbound = "chat/+/in"
//! outbound = "chat/out"
//!
//! [reconnect]
//! initial_delay_ms = 5000
//! max_delay_ms = 60000
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Environment variable overriding `mqtt.broker_url`
pub const ENV_BROKER_URL: &str = "MQTT_BROKER_URL";
/// Environment variable overriding `mqtt.username`
pub const ENV_USERNAME: &str = "MQTT_USERNAME";
/// Environment variable overriding `mqtt.password`
pub const ENV_PASSWORD: &str = "MQTT_PASSWORD";
/// Environment variable overriding `mqtt.client_id`
pub const ENV_CLIENT_ID: &str = "MQTT_CLIENT_ID";

/// Smallest keep-alive interval accepted by the engine
pub const MIN_KEEP_ALIVE_SECS: u64 = 5;

/// Top-level client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub mqtt: MqttSection,
    #[serde(default)]
    pub topics: TopicsSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL, e.g. `mqtt://localhost:1883` or `mqtts://broker:8883`
    pub broker_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Client identifier; a random one is generated when absent
    pub client_id: Option<String>,
    /// Default quality of service for publish and subscribe (0, 1 or 2)
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    pub tls: Option<TlsSection>,
}

/// Certificate material passed through to the protocol engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TlsSection {
    /// PEM encoded CA certificate
    pub ca_file: PathBuf,
    pub client_cert_file: Option<PathBuf>,
    pub client_key_file: Option<PathBuf>,
}

/// Default topics used by `subscribe_inbound` / `publish_outbound`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TopicsSection {
    pub inbound: Option<String>,
    pub outbound: Option<String>,
}

/// Reconnection timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Fraction of the base delay added as random jitter
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
    /// How long `connect()` blocks before returning while retries continue
    #[serde(default = "default_connect_grace_ms")]
    pub connect_grace_ms: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
            connect_grace_ms: default_connect_grace_ms(),
        }
    }
}

impl ReconnectSection {
    pub fn connect_grace(&self) -> Duration {
        Duration::from_millis(self.connect_grace_ms)
    }
}

fn default_qos() -> u8 {
    1
}

fn default_keep_alive() -> u64 {
    60
}

fn default_initial_delay_ms() -> u64 {
    5_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_jitter_ratio() -> f64 {
    0.2
}

fn default_connect_grace_ms() -> u64 {
    5_000
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientConfig {
    /// Build a configuration for a broker with every other field defaulted
    pub fn new(broker_url: impl Into<String>) -> Self {
        Self {
            mqtt: MqttSection {
                broker_url: broker_url.into(),
                username: None,
                password: None,
                client_id: None,
                qos: default_qos(),
                keep_alive_secs: default_keep_alive(),
                tls: None,
            },
            topics: TopicsSection::default(),
            reconnect: ReconnectSection::default(),
        }
    }

    /// Load configuration from a TOML file, apply environment overrides and validate
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: ClientConfig = toml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary lookup; empty values are ignored
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| lookup(name).filter(|value| !value.is_empty());

        if let Some(url) = lookup(ENV_BROKER_URL) {
            self.mqtt.broker_url = url;
        }
        if let Some(username) = lookup(ENV_USERNAME) {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = lookup(ENV_PASSWORD) {
            self.mqtt.password = Some(password);
        }
        if let Some(client_id) = lookup(ENV_CLIENT_ID) {
            self.mqtt.client_id = Some(client_id);
        }
    }

    /// Check field ranges and the broker URL
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_broker_url(&self.mqtt.broker_url)?;

        if self.mqtt.qos > 2 {
            return Err(ConfigError::InvalidConfig(format!(
                "qos must be 0, 1 or 2, got {}",
                self.mqtt.qos
            )));
        }

        if self.mqtt.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            return Err(ConfigError::InvalidConfig(format!(
                "keep_alive_secs must be at least {MIN_KEEP_ALIVE_SECS}, got {}",
                self.mqtt.keep_alive_secs
            )));
        }

        let reconnect = &self.reconnect;
        if reconnect.initial_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.initial_delay_ms must be greater than 0".to_string(),
            ));
        }
        if reconnect.max_delay_ms < reconnect.initial_delay_ms {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_delay_ms must not be below reconnect.initial_delay_ms".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&reconnect.jitter_ratio) {
            return Err(ConfigError::InvalidConfig(format!(
                "reconnect.jitter_ratio must be within [0, 1], got {}",
                reconnect.jitter_ratio
            )));
        }

        Ok(())
    }

    /// Copy of this config with secrets blanked, for display
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.mqtt.password.is_some() {
            copy.mqtt.password = Some("***".to_string());
        }
        if let Ok(mut url) = Url::parse(&copy.mqtt.broker_url) {
            if url.password().is_some() && url.set_password(Some("***")).is_ok() {
                copy.mqtt.broker_url = url.to_string();
            }
        }
        copy
    }
}

/// Broker URLs must parse and carry a host and an MQTT scheme
fn validate_broker_url(broker_url: &str) -> Result<(), ConfigError> {
    let url =
        Url::parse(broker_url).map_err(|_| ConfigError::InvalidBrokerUrl(broker_url.to_string()))?;

    if !matches!(url.scheme(), "mqtt" | "mqtts" | "tcp" | "ssl") {
        return Err(ConfigError::InvalidBrokerUrl(format!(
            "unsupported scheme '{}' in {broker_url}",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(ConfigError::InvalidBrokerUrl(broker_url.to_string()));
    }

    Ok(())
}
