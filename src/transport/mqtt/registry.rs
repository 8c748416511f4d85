//! Subscription pattern to handler mapping
//!
//! Handlers registered on the same pattern accumulate and run in registration
//! order. Dispatch runs the exact-match entry first, then every other pattern
//! whose wildcards match the concrete topic. Each handler runs in isolation: an
//! error or panic in one is logged and the rest still run.

use super::connection::qos_level;
use super::topic_matcher;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// QoS recorded for patterns registered without an explicit level
pub const DEFAULT_QOS: QoS = QoS::AtLeastOnce;

/// Failure reported by a message handler
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Callback invoked with the concrete topic and raw payload of an inbound message
pub type Handler = Arc<dyn Fn(&str, &[u8]) -> Result<(), HandlerError> + Send + Sync>;

/// A received message, alive only for the duration of its dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEnvelope {
    pub topic: String,
    pub payload: Bytes,
}

impl InboundEnvelope {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Outcome of one dispatch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub invoked: usize,
    pub failed: usize,
}

struct Subscription {
    pattern: String,
    qos: QoS,
    handlers: Vec<Handler>,
}

/// Registered patterns and their handlers, in registration order
#[derive(Default)]
pub struct HandlerRegistry {
    subscriptions: Vec<Subscription>,
    index: HashMap<String, usize>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler for `pattern` at the default QoS
    pub fn register(&mut self, pattern: &str, handler: Handler) {
        self.register_with_qos(pattern, DEFAULT_QOS, handler);
    }

    /// Append a handler for `pattern`; the pattern keeps the highest QoS requested for it
    pub fn register_with_qos(&mut self, pattern: &str, qos: QoS, handler: Handler) {
        match self.index.get(pattern) {
            Some(&position) => {
                let subscription = &mut self.subscriptions[position];
                if qos_level(qos) > qos_level(subscription.qos) {
                    subscription.qos = qos;
                }
                subscription.handlers.push(handler);
            }
            None => {
                self.index.insert(pattern.to_string(), self.subscriptions.len());
                self.subscriptions.push(Subscription {
                    pattern: pattern.to_string(),
                    qos,
                    handlers: vec![handler],
                });
            }
        }
    }

    /// Handlers for a concrete topic: exact entry first, then wildcard matches
    pub fn matching_handlers(&self, topic: &str) -> Vec<Handler> {
        let exact = self.index.get(topic).copied();
        let mut handlers: Vec<Handler> = exact
            .map(|position| self.subscriptions[position].handlers.clone())
            .unwrap_or_default();

        for (position, subscription) in self.subscriptions.iter().enumerate() {
            if Some(position) == exact {
                continue;
            }
            if topic_matcher::matches(&subscription.pattern, topic) {
                handlers.extend(subscription.handlers.iter().cloned());
            }
        }

        handlers
    }

    /// Invoke every handler matching `topic`
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> DispatchReport {
        invoke_all(&self.matching_handlers(topic), topic, payload)
    }

    /// Registered patterns with their recorded QoS, in registration order
    pub fn patterns(&self) -> Vec<(String, QoS)> {
        self.subscriptions
            .iter()
            .map(|s| (s.pattern.clone(), s.qos))
            .collect()
    }

    pub fn handler_count(&self, pattern: &str) -> usize {
        self.index
            .get(pattern)
            .map_or(0, |&position| self.subscriptions[position].handlers.len())
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn clear(&mut self) {
        self.subscriptions.clear();
        self.index.clear();
    }
}

/// Run handlers in order, isolating each one's failure
pub fn invoke_all(handlers: &[Handler], topic: &str, payload: &[u8]) -> DispatchReport {
    let mut report = DispatchReport::default();

    for (position, handler) in handlers.iter().enumerate() {
        report.invoked += 1;
        match panic::catch_unwind(AssertUnwindSafe(|| handler(topic, payload))) {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                report.failed += 1;
                warn!(topic, handler = position, error = %error, "Message handler failed");
            }
            Err(panic) => {
                report.failed += 1;
                warn!(
                    topic,
                    handler = position,
                    panic = %panic_message(panic.as_ref()),
                    "Message handler panicked"
                );
            }
        }
    }

    debug!(topic, invoked = report.invoked, failed = report.failed, "Dispatch complete");
    report
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
