//! mqttlink - a managed MQTT client
//!
//! Owns a single broker connection, tracks topic subscriptions, delivers
//! inbound messages to every handler whose pattern matches (including `+` and
//! `#` wildcards) and publishes outbound messages, while surviving connection
//! loss through backoff-driven reconnection.
//!
//! # Overview
//!
//! - [`transport::mqtt::MqttClient`] - the public client surface
//! - [`transport::mqtt::ConnectionSession`] - connect/reconnect state machine
//! - [`transport::mqtt::topic_matcher`] - pure wildcard matching
//! - [`config::ClientConfig`] - TOML configuration with environment overrides
//!
//! # Quick Start
//!
//! ```rust
//! use mqttlink::transport::mqtt::topic_matcher;
//!
//! assert!(topic_matcher::matches("home/+/temperature", "home/kitchen/temperature"));
//! assert!(topic_matcher::matches("home/#", "home"));
//! assert!(!topic_matcher::matches("home/+", "home/kitchen/light"));
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod testing;
pub mod transport;

pub use config::{ClientConfig, ConfigError};
pub use error::{ClientError, ClientResult};
pub use transport::mqtt::{ConnectOutcome, ConnectionState, HandlerError, MqttClient, MqttError, QoS};
