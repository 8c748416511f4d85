//! Mock protocol engine for testing
//!
//! `MockEngine` records every connection it opens; each `MockConnection` records
//! the subscribe, publish, reconnect and end calls made on it and lets tests
//! inject engine events as if a broker had produced them.

use crate::transport::mqtt::{
    ConnectOptions, EngineEvent, EventSink, InboundEnvelope, MqttError, ProtocolConnection,
    ProtocolEngine, QoS,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A message handed to `MockConnection::publish`
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Mock engine for testing
#[derive(Clone, Default)]
pub struct MockEngine {
    connections: Arc<Mutex<Vec<Arc<MockConnection>>>>,
    fail_open: Arc<AtomicBool>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `open` calls fail
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Number of connections successfully opened
    pub fn open_count(&self) -> usize {
        lock(&self.connections).len()
    }

    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        lock(&self.connections).clone()
    }

    pub fn latest_connection(&self) -> Option<Arc<MockConnection>> {
        lock(&self.connections).last().cloned()
    }

    /// Wait until at least `count` connections were opened, for up to two seconds
    pub async fn wait_for_open(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while self.open_count() < count && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl ProtocolEngine for MockEngine {
    fn open(
        &self,
        options: &ConnectOptions,
        events: EventSink,
    ) -> Result<Arc<dyn ProtocolConnection>, MqttError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(MqttError::Connection("mock open failure".to_string()));
        }

        let connection = Arc::new(MockConnection::new(options.clone(), events));
        lock(&self.connections).push(connection.clone());
        Ok(connection)
    }
}

/// Mock connection for testing
pub struct MockConnection {
    options: ConnectOptions,
    events: EventSink,
    connected: AtomicBool,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    published: Mutex<Vec<PublishedMessage>>,
    end_calls: Mutex<Vec<bool>>,
    reconnect_calls: AtomicUsize,
    fail_subscribe: AtomicBool,
    fail_publish: AtomicBool,
    subscribe_held: watch::Sender<bool>,
}

impl MockConnection {
    fn new(options: ConnectOptions, events: EventSink) -> Self {
        Self {
            options,
            events,
            connected: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            end_calls: Mutex::new(Vec::new()),
            reconnect_calls: AtomicUsize::new(0),
            fail_subscribe: AtomicBool::new(false),
            fail_publish: AtomicBool::new(false),
            subscribe_held: watch::channel(false).0,
        }
    }

    /// Options the connection was opened with
    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// Broker accepted the connection
    pub async fn simulate_connect(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.events.emit(EngineEvent::Connected).await;
    }

    pub async fn simulate_message(&self, topic: &str, payload: &[u8]) {
        let envelope = InboundEnvelope::new(topic, Bytes::copy_from_slice(payload));
        self.events.emit(EngineEvent::Message(envelope)).await;
    }

    pub async fn simulate_error(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.events.emit(EngineEvent::Error(reason.to_string())).await;
    }

    pub async fn simulate_close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.events.emit(EngineEvent::Close).await;
    }

    pub async fn simulate_offline(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.events.emit(EngineEvent::Offline).await;
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        lock(&self.subscriptions).clone()
    }

    /// Wait until at least `count` subscribes were recorded, for up to two seconds
    pub async fn wait_for_subscriptions(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while self.subscriptions().len() < count && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Park `subscribe` calls until released, like an event loop that stopped polling
    pub fn set_hold_subscribe(&self, hold: bool) {
        self.subscribe_held.send_replace(hold);
    }

    pub fn clear_subscriptions(&self) {
        lock(&self.subscriptions).clear();
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.published).clone()
    }

    /// `force` flag of every `end` call, in order
    pub fn end_calls(&self) -> Vec<bool> {
        lock(&self.end_calls).clone()
    }

    pub fn reconnect_calls(&self) -> usize {
        self.reconnect_calls.load(Ordering::SeqCst)
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProtocolConnection for MockConnection {
    async fn subscribe(&self, pattern: &str, qos: QoS) -> Result<(), MqttError> {
        let mut held = self.subscribe_held.subscribe();
        let _ = held.wait_for(|held| !held).await;

        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(MqttError::Subscribe {
                pattern: pattern.to_string(),
                reason: "mock subscribe failure".to_string(),
            });
        }
        lock(&self.subscriptions).push((pattern.to_string(), qos));
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(MqttError::Publish("mock publish failure".to_string()));
        }
        lock(&self.published).push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    async fn end(&self, force: bool) -> Result<(), MqttError> {
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.end_calls).push(force);
        Ok(())
    }

    fn reconnect(&self) -> Result<(), MqttError> {
        self.reconnect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
