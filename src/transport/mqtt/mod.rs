//! Managed MQTT client implementation
//!
//! The module separates pure functions from I/O operations for testability.
//!
//! # Architecture
//!
//! - [`topic_matcher`] - Pure wildcard matching of topics against patterns
//! - [`registry`] - Pattern to handler mapping and isolated dispatch
//! - [`backoff`] - Reconnect delay computation
//! - [`health_monitor`] - Pure state transition and reconnection decisions
//! - [`connection`] - Connection state, errors and connect options
//! - [`engine`] - Boundary to the wire protocol implementation
//! - [`message_handler`] - Pure routing of raw rumqttc events
//! - [`rumqttc_engine`] - Impure rumqttc-backed engine
//! - [`session`] - The connection session state machine
//! - [`client`] - Public client surface
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqttlink::config::ClientConfig;
//! use mqttlink::transport::mqtt::MqttClient;
//!
//! # tokio_test::block_on(async {
//! let client = MqttClient::new(ClientConfig::new("mqtt://localhost:1883"))?;
//! client.connect().await;
//! client
//!     .subscribe(
//!         "sensors/+/temperature",
//!         |topic, payload| {
//!             println!("{topic}: {}", String::from_utf8_lossy(payload));
//!             Ok(())
//!         },
//!         None,
//!     )
//!     .await;
//! client.publish("sensors/kitchen/temperature", "21.5", None).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod backoff;
pub mod client;
pub mod connection;
pub mod engine;
pub mod health_monitor;
pub mod message_handler;
pub mod registry;
pub mod rumqttc_engine;
pub mod session;
pub mod topic_matcher;

// Re-export public types for convenience
pub use backoff::BackoffPolicy;
pub use client::MqttClient;
pub use connection::{qos_from_u8, ConnectOptions, ConnectOutcome, ConnectionState, MqttError};
pub use engine::{EngineEvent, ProtocolConnection, ProtocolEngine};
pub use health_monitor::{HealthMetrics, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageHandler};
pub use registry::{DispatchReport, Handler, HandlerError, HandlerRegistry, InboundEnvelope};
pub use rumqttc::v5::mqttbytes::QoS;
pub use rumqttc_engine::RumqttcEngine;
pub use session::{ConnectionSession, EventSink};
