//! Protocol engine boundary
//!
//! The session never speaks the wire protocol itself. It opens connections
//! through a [`ProtocolEngine`] and receives the connection's events through the
//! [`EventSink`] handed to `open`. Adapters must deliver events one at a time,
//! awaiting each `emit` before the next.

use super::connection::{ConnectOptions, MqttError};
use super::registry::InboundEnvelope;
use super::session::EventSink;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use std::sync::Arc;

/// Events reported by an engine connection
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Broker accepted the connection
    Connected,
    /// Inbound message on a subscribed topic
    Message(InboundEnvelope),
    /// Transport-level failure
    Error(String),
    /// Broker or transport closed the connection
    Close,
    /// Network became unreachable
    Offline,
}

/// Factory for engine connections
pub trait ProtocolEngine: Send + Sync {
    /// Start connecting; the outcome arrives later as events on `events`
    fn open(
        &self,
        options: &ConnectOptions,
        events: EventSink,
    ) -> Result<Arc<dyn ProtocolConnection>, MqttError>;
}

/// A single broker connection owned by the session
#[async_trait]
pub trait ProtocolConnection: Send + Sync {
    async fn subscribe(&self, pattern: &str, qos: QoS) -> Result<(), MqttError>;

    /// Resolves once the broker has the message
    ///
    /// That is PUBACK for QoS 1, PUBCOMP for QoS 2 and the socket write for
    /// QoS 0. A refused acknowledgement or a connection lost first rejects
    /// with `MqttError::Publish`.
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError>;

    /// Close the connection; `force` skips flushing queued outbound work
    async fn end(&self, force: bool) -> Result<(), MqttError>;

    /// Retry the connection after a loss
    fn reconnect(&self) -> Result<(), MqttError>;

    /// True transport state
    fn is_connected(&self) -> bool;
}
