//! Pure connection state management for the MQTT session
//!
//! This module contains the session's state enum, the transport error taxonomy
//! and engine-independent connection options derived from configuration.

use crate::config::{ClientConfig, TlsSection};
use rumqttc::v5::mqttbytes::QoS;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Connection state of a session
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// No connection and no pending attempt
    Disconnected,
    /// A connection attempt is in flight
    Connecting,
    /// Engine reported the connection as established
    Connected,
    /// Connection lost; a reconnect timer is armed
    ReconnectScheduled { attempt: u32, delay: Duration },
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::ReconnectScheduled { attempt, delay } => {
                write!(f, "reconnect #{attempt} scheduled in {delay:?}")
            }
        }
    }
}

/// What `connect()` observed before returning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The broker connection is established
    Connected,
    /// The grace period elapsed; retries continue in the background
    Pending,
    /// `disconnect()` was called before the broker accepted
    Cancelled,
}

/// Transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Not connected - current state: {state}")]
    NotConnected { state: ConnectionState },
    #[error("Subscription to '{pattern}' failed: {reason}")]
    Subscribe { pattern: String, reason: String },
    #[error("Publishing failed: {0}")]
    Publish(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid QoS level: {0}")]
    InvalidQos(u8),
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error("No default {0} topic configured")]
    NoDefaultTopic(&'static str),
}

/// Convert a numeric QoS level into the protocol enum
pub fn qos_from_u8(level: u8) -> Result<QoS, MqttError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(MqttError::InvalidQos(other)),
    }
}

/// Numeric level of a QoS value
pub fn qos_level(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

/// Everything an engine needs to open a broker connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub tls: Option<TlsSection>,
}

impl ConnectOptions {
    /// Derive connection options from configuration
    ///
    /// A random client id is generated when none is configured. Credentials
    /// embedded in the broker URL are used when `mqtt.username` is unset.
    pub fn from_config(config: &ClientConfig) -> Result<Self, MqttError> {
        let mqtt = &config.mqtt;
        let url = Url::parse(&mqtt.broker_url)
            .map_err(|_| MqttError::InvalidBrokerUrl(mqtt.broker_url.clone()))?;

        let use_tls = match url.scheme() {
            "mqtts" | "ssl" => true,
            "mqtt" | "tcp" => false,
            _ => return Err(MqttError::InvalidBrokerUrl(mqtt.broker_url.clone())),
        };
        let host = url
            .host_str()
            .ok_or_else(|| MqttError::InvalidBrokerUrl(mqtt.broker_url.clone()))?
            .to_string();
        let port = url.port().unwrap_or(if use_tls { 8883 } else { 1883 });

        let client_id = mqtt
            .client_id
            .clone()
            .unwrap_or_else(|| format!("mqttlink-{}", uuid::Uuid::new_v4().simple()));

        let (username, password) = match &mqtt.username {
            Some(username) => (Some(username.clone()), mqtt.password.clone()),
            None if !url.username().is_empty() => (
                Some(url.username().to_string()),
                url.password()
                    .map(str::to_string)
                    .or_else(|| mqtt.password.clone()),
            ),
            None => (None, mqtt.password.clone()),
        };

        Ok(Self {
            host,
            port,
            use_tls: use_tls || mqtt.tls.is_some(),
            client_id,
            username,
            password,
            keep_alive: Duration::from_secs(mqtt.keep_alive_secs),
            tls: mqtt.tls.clone(),
        })
    }
}
