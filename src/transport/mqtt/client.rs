//! Public MQTT client
//!
//! `MqttClient` wraps one [`ConnectionSession`] and applies the configured
//! defaults (QoS, inbound and outbound topics) on top of it.

use super::backoff::BackoffPolicy;
use super::connection::{qos_from_u8, ConnectOptions, ConnectOutcome, ConnectionState, MqttError};
use super::engine::ProtocolEngine;
use super::health_monitor::HealthMetrics;
use super::registry::{Handler, HandlerError};
use super::rumqttc_engine::RumqttcEngine;
use super::session::ConnectionSession;
use crate::config::ClientConfig;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use std::sync::Arc;
use tracing::{info, Instrument};

/// Managed MQTT client with wildcard dispatch and automatic reconnection
pub struct MqttClient {
    config: ClientConfig,
    default_qos: QoS,
    session: ConnectionSession,
}

impl MqttClient {
    /// Client backed by the rumqttc engine
    pub fn new(config: ClientConfig) -> Result<Self, MqttError> {
        Self::with_engine(config, Arc::new(RumqttcEngine::default()))
    }

    /// Client backed by a caller-supplied engine
    pub fn with_engine(
        config: ClientConfig,
        engine: Arc<dyn ProtocolEngine>,
    ) -> Result<Self, MqttError> {
        let options = ConnectOptions::from_config(&config)?;
        let default_qos = qos_from_u8(config.mqtt.qos)?;
        let backoff = BackoffPolicy::from(&config.reconnect);
        let session = ConnectionSession::new(
            options,
            engine,
            backoff,
            config.reconnect.connect_grace(),
        );

        Ok(Self {
            config,
            default_qos,
            session,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connect, waiting at most the configured grace period
    pub async fn connect(&self) -> ConnectOutcome {
        let broker_url = self.config.redacted().mqtt.broker_url;
        let outcome = self
            .session
            .connect()
            .instrument(crate::mqtt_span!(operation = "connect", broker = %broker_url))
            .await;
        if outcome == ConnectOutcome::Connected {
            info!("Connected to {}", broker_url);
        }
        outcome
    }

    /// Disconnect without reconnecting; all handlers are dropped
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        self.session
            .disconnect()
            .instrument(crate::mqtt_span!(operation = "disconnect"))
            .await
    }

    /// Publish to `topic`, using the configured QoS when `qos` is `None`
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: Option<QoS>,
    ) -> Result<(), MqttError> {
        self.session
            .publish(topic, payload.into(), qos.unwrap_or(self.default_qos), false)
            .await
    }

    /// Publish a retained message
    pub async fn publish_retained(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: Option<QoS>,
    ) -> Result<(), MqttError> {
        self.session
            .publish(topic, payload.into(), qos.unwrap_or(self.default_qos), true)
            .await
    }

    /// Publish to the configured outbound topic
    pub async fn publish_outbound(&self, payload: impl Into<Bytes>) -> Result<(), MqttError> {
        let topic = self
            .config
            .topics
            .outbound
            .as_deref()
            .ok_or(MqttError::NoDefaultTopic("outbound"))?;
        self.publish(topic, payload, None).await
    }

    /// Register `handler` for `pattern`; never fails
    pub async fn subscribe<F>(&self, pattern: &str, handler: F, qos: Option<QoS>)
    where
        F: Fn(&str, &[u8]) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe_handler(pattern, Arc::new(handler), qos).await;
    }

    /// Register an already shared handler for `pattern`
    pub async fn subscribe_handler(&self, pattern: &str, handler: Handler, qos: Option<QoS>) {
        self.session
            .subscribe_handler(pattern, qos.unwrap_or(self.default_qos), handler)
            .await;
    }

    /// Register `handler` for the configured inbound pattern
    pub async fn subscribe_inbound<F>(&self, handler: F) -> Result<(), MqttError>
    where
        F: Fn(&str, &[u8]) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let pattern = self
            .config
            .topics
            .inbound
            .as_deref()
            .ok_or(MqttError::NoDefaultTopic("inbound"))?;
        self.subscribe(pattern, handler, None).await;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn health_metrics(&self) -> HealthMetrics {
        self.session.health_metrics()
    }

    /// The session behind this client
    pub fn session(&self) -> &ConnectionSession {
        &self.session
    }
}
