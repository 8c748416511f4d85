//! Connection session state machine
//!
//! The session exclusively owns the engine connection and drives it through
//! `Disconnected -> Connecting -> Connected`, scheduling backoff-delayed
//! reconnects on unexpected loss and resubscribing every registered pattern
//! once the broker accepts a (re)connection.
//!
//! All mutable fields sit behind one mutex so multi-step transitions stay
//! atomic. The lock is never held across an `.await`, and handlers always run
//! with no lock held. Lock order is state, then registry.

use super::backoff::BackoffPolicy;
use super::connection::{ConnectOptions, ConnectOutcome, ConnectionState, MqttError};
use super::engine::{EngineEvent, ProtocolConnection, ProtocolEngine};
use super::health_monitor::{
    ConnectionEvent, HealthMetrics, HealthMonitor, ReconnectionDecision, SessionStats,
};
use super::registry::{self, Handler, HandlerError, HandlerRegistry, InboundEnvelope};
use crate::error::sanitize_error_message;
use bytes::Bytes;
use chrono::Utc;
use rumqttc::v5::mqttbytes::QoS;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Handle through which an engine connection reports its events
///
/// Each sink is bound to the connection it was created for. Events from a
/// connection the session has since replaced or torn down are dropped.
#[derive(Clone)]
pub struct EventSink {
    session: Weak<SessionInner>,
    generation: u64,
}

impl EventSink {
    /// Deliver one event and wait until the session has fully processed it
    pub async fn emit(&self, event: EngineEvent) {
        match self.session.upgrade() {
            Some(session) => session.handle_event(self.generation, event).await,
            None => debug!(target: "mqtt_transport", "Session dropped, discarding {:?}", event),
        }
    }

    /// Connection generation this sink reports for
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("generation", &self.generation)
            .finish()
    }
}

struct ReconnectTimer {
    id: u64,
    handle: JoinHandle<()>,
}

struct SessionState {
    connection: Option<Arc<dyn ProtocolConnection>>,
    generation: u64,
    attempts: u32,
    manual_disconnect: bool,
    reconnect_timer: Option<ReconnectTimer>,
    next_timer_id: u64,
    resubscription: Option<JoinHandle<()>>,
    phase: ConnectionState,
    stats: SessionStats,
}

impl SessionState {
    fn accepts(&self, generation: u64) -> bool {
        !self.manual_disconnect && self.generation == generation
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.handle.abort();
            debug!(target: "mqtt_transport", "Cancelled reconnect timer {}", timer.id);
        }
    }

    fn cancel_resubscription(&mut self) {
        if let Some(sweep) = self.resubscription.take() {
            sweep.abort();
        }
    }
}

struct SessionInner {
    options: ConnectOptions,
    engine: Arc<dyn ProtocolEngine>,
    backoff: BackoffPolicy,
    connect_grace: Duration,
    state: Mutex<SessionState>,
    registry: Mutex<HandlerRegistry>,
    state_tx: watch::Sender<ConnectionState>,
}

/// A single managed broker session
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct ConnectionSession {
    inner: Arc<SessionInner>,
}

impl ConnectionSession {
    pub fn new(
        options: ConnectOptions,
        engine: Arc<dyn ProtocolEngine>,
        backoff: BackoffPolicy,
        connect_grace: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            inner: Arc::new(SessionInner {
                options,
                engine,
                backoff,
                connect_grace,
                state: Mutex::new(SessionState {
                    connection: None,
                    generation: 0,
                    attempts: 0,
                    manual_disconnect: false,
                    reconnect_timer: None,
                    next_timer_id: 0,
                    resubscription: None,
                    phase: ConnectionState::Disconnected,
                    stats: SessionStats::default(),
                }),
                registry: Mutex::new(HandlerRegistry::new()),
                state_tx,
            }),
        }
    }

    /// Connect to the broker, waiting at most the grace period
    ///
    /// Concurrent callers share one attempt. When the grace period elapses
    /// first, `Pending` is returned and retries continue in the background.
    /// A `disconnect()` during the wait ends it early with `Cancelled`.
    pub async fn connect(&self) -> ConnectOutcome {
        let mut state_rx = self.inner.state_tx.subscribe();

        {
            let mut state = self.inner.lock_state();
            if state
                .connection
                .as_ref()
                .is_some_and(|connection| connection.is_connected())
            {
                return ConnectOutcome::Connected;
            }

            state.manual_disconnect = false;
            if state.connection.is_some() || state.reconnect_timer.is_some() {
                debug!(target: "mqtt_transport", "Connection attempt already in flight, joining it");
            } else {
                self.inner.open_connection(&mut state);
            }
        }

        // Disconnected is only reachable from here through a manual disconnect.
        let settled = tokio::time::timeout(
            self.inner.connect_grace,
            state_rx.wait_for(|state| {
                matches!(state, ConnectionState::Connected | ConnectionState::Disconnected)
            }),
        )
        .await;

        let connected = match settled {
            Ok(Ok(state)) => *state == ConnectionState::Connected,
            _ => false,
        };
        if connected {
            return ConnectOutcome::Connected;
        }

        if self.inner.lock_state().manual_disconnect {
            info!(
                "Connect to {}:{} cancelled by disconnect",
                self.inner.options.host, self.inner.options.port
            );
            return ConnectOutcome::Cancelled;
        }

        warn!(
            "Broker {}:{} not reachable within {:?}, retrying in the background",
            self.inner.options.host, self.inner.options.port, self.inner.connect_grace
        );
        ConnectOutcome::Pending
    }

    /// Tear the session down and suppress all automatic reconnects
    ///
    /// Registered handlers are dropped. Resolves once the engine connection
    /// has closed.
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        let connection = {
            let mut state = self.inner.lock_state();
            state.manual_disconnect = true;
            state.cancel_timer();
            state.cancel_resubscription();
            state.attempts = 0;
            state.generation += 1;
            state.stats.connect_time = None;
            self.inner.lock_registry().clear();
            self.inner
                .transition(&mut state, ConnectionEvent::ManualDisconnect);
            state.connection.take()
        };

        match connection {
            Some(connection) => connection.end(true).await.map_err(|e| {
                error!("Failed to close MQTT connection: {}", e);
                e
            }),
            None => Ok(()),
        }
    }

    /// Publish through the live connection
    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError> {
        let connection = {
            let state = self.inner.lock_state();
            let live = state
                .connection
                .clone()
                .filter(|connection| connection.is_connected());
            HealthMonitor::check_publish_allowed(live, &state.phase)?
        };

        debug!(target: "mqtt_transport", "Publishing {} bytes to {}", payload.len(), topic);
        connection
            .publish(topic, payload, qos, retain)
            .await
            .map_err(|e| {
                warn!("Publish to {} failed: {}", topic, e);
                e
            })
    }

    /// Register a handler closure for `pattern`
    pub async fn subscribe<F>(&self, pattern: &str, qos: QoS, handler: F)
    where
        F: Fn(&str, &[u8]) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe_handler(pattern, qos, Arc::new(handler)).await;
    }

    /// Register a handler for `pattern`, subscribing immediately when connected
    ///
    /// The pattern stays registered even if the broker subscribe fails; it is
    /// retried on the next resubscription sweep.
    pub async fn subscribe_handler(&self, pattern: &str, qos: QoS, handler: Handler) {
        let connection = {
            let state = self.inner.lock_state();
            self.inner
                .lock_registry()
                .register_with_qos(pattern, qos, handler);
            state
                .connection
                .clone()
                .filter(|connection| connection.is_connected())
        };

        let Some(connection) = connection else {
            debug!(target: "mqtt_transport", "Queued subscription to {} until connected", pattern);
            return;
        };

        match connection.subscribe(pattern, qos).await {
            Ok(()) => debug!(target: "mqtt_transport", "Subscribed to {}", pattern),
            Err(e) => warn!(
                "{}",
                MqttError::Subscribe {
                    pattern: pattern.to_string(),
                    reason: e.to_string(),
                }
            ),
        }
    }

    /// Feed an event for the current connection into the state machine
    pub async fn handle_event(&self, event: EngineEvent) {
        let generation = self.inner.lock_state().generation;
        self.inner.handle_event(generation, event).await;
    }

    /// True transport state of the engine connection
    pub fn is_connected(&self) -> bool {
        self.inner
            .lock_state()
            .connection
            .as_ref()
            .is_some_and(|connection| connection.is_connected())
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock_state().phase.clone()
    }

    /// Receiver that observes every state transition
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock_state().attempts
    }

    pub fn has_pending_reconnect(&self) -> bool {
        self.inner.lock_state().reconnect_timer.is_some()
    }

    /// Registered patterns with the QoS used for resubscription
    pub fn registered_patterns(&self) -> Vec<(String, QoS)> {
        let _state = self.inner.lock_state();
        self.inner.lock_registry().patterns()
    }

    pub fn health_metrics(&self) -> HealthMetrics {
        HealthMonitor::calculate_health_metrics(&self.inner.lock_state().stats)
    }
}

impl SessionInner {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_registry(&self) -> MutexGuard<'_, HandlerRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, state: &mut SessionState, event: ConnectionEvent) {
        let next = HealthMonitor::determine_next_state(&event);
        HealthMonitor::log_state_transition(&state.phase, &next);
        state.phase = next.clone();
        self.state_tx.send_replace(next);
    }

    /// Open a fresh engine connection; only called when none exists
    fn open_connection(self: &Arc<Self>, state: &mut SessionState) {
        state.generation += 1;
        let events = EventSink {
            session: Arc::downgrade(self),
            generation: state.generation,
        };
        self.transition(state, ConnectionEvent::OpenStarted);

        match self.engine.open(&self.options, events) {
            Ok(connection) => {
                info!(
                    "Opening MQTT connection to {}:{} as {}",
                    self.options.host, self.options.port, self.options.client_id
                );
                state.connection = Some(connection);
            }
            Err(e) => {
                error!(
                    "Failed to open MQTT connection: {}",
                    sanitize_error_message(&e.to_string())
                );
                self.schedule_reconnect(state);
            }
        }
    }

    async fn handle_event(self: &Arc<Self>, generation: u64, event: EngineEvent) {
        match event {
            EngineEvent::Connected => self.on_connected(generation),
            EngineEvent::Message(envelope) => self.on_message(generation, envelope),
            EngineEvent::Error(reason) => {
                warn!("MQTT connection error: {}", sanitize_error_message(&reason));
                self.on_connection_lost(generation, "error");
            }
            EngineEvent::Close => self.on_connection_lost(generation, "close"),
            EngineEvent::Offline => self.on_connection_lost(generation, "offline"),
        }
    }

    /// Accept a (re)connection and start resubscribing in the background
    ///
    /// The sweep runs off the event path. Engines may need to keep delivering
    /// events, such as a loss mid-sweep, before a subscribe can complete.
    fn on_connected(self: &Arc<Self>, generation: u64) {
        let mut state = self.lock_state();
        if !state.accepts(generation) {
            debug!(target: "mqtt_transport", "Ignoring connect event from stale connection");
            return;
        }

        state.attempts = 0;
        state.cancel_timer();
        state.cancel_resubscription();
        state.stats.connect_time = Some(Instant::now());
        state.stats.connected_at = Some(Utc::now());
        self.transition(&mut state, ConnectionEvent::ConnAckReceived);

        let patterns = self.lock_registry().patterns();
        let Some(connection) = state.connection.clone() else {
            return;
        };
        if patterns.is_empty() {
            return;
        }

        state.resubscription = Some(tokio::spawn(resubscribe_all(
            Arc::downgrade(self),
            generation,
            connection,
            patterns,
        )));
    }

    /// Whether events and work tagged with `generation` still apply
    fn is_current(&self, generation: u64) -> bool {
        self.lock_state().accepts(generation)
    }

    fn on_message(&self, generation: u64, envelope: InboundEnvelope) {
        let _span = crate::dispatch_span!(topic = %envelope.topic).entered();
        let handlers = {
            let state = self.lock_state();
            if !state.accepts(generation) {
                debug!(target: "mqtt_transport", "Dropping message on {} from stale connection", envelope.topic);
                return;
            }
            self.lock_registry().matching_handlers(&envelope.topic)
        };

        if handlers.is_empty() {
            debug!(target: "mqtt_transport", "No handlers for topic {}", envelope.topic);
        }

        let report = registry::invoke_all(&handlers, &envelope.topic, &envelope.payload);

        let mut state = self.lock_state();
        state.stats.last_message_time = Some(Instant::now());
        state.stats.messages_dispatched += report.invoked as u64;
        state.stats.handler_failures += report.failed as u64;
    }

    fn on_connection_lost(self: &Arc<Self>, generation: u64, cause: &str) {
        let mut state = self.lock_state();
        if state.manual_disconnect {
            debug!(target: "mqtt_transport", "Ignoring {} after manual disconnect", cause);
            return;
        }
        if state.generation != generation {
            debug!(target: "mqtt_transport", "Ignoring {} from stale connection", cause);
            return;
        }

        info!("MQTT connection lost ({})", cause);
        state.stats.connect_time = None;
        self.schedule_reconnect(&mut state);
    }

    /// Arm the one-shot reconnect timer unless one is already pending
    fn schedule_reconnect(self: &Arc<Self>, state: &mut SessionState) {
        let decision = HealthMonitor::should_schedule_reconnect(
            state.attempts,
            &self.backoff,
            state.manual_disconnect,
            state.reconnect_timer.is_some(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay } => {
                state.attempts = attempt;
                state.stats.reconnect_count += 1;
                state.next_timer_id += 1;
                let id = state.next_timer_id;

                let session = Arc::downgrade(self);
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(session) = session.upgrade() {
                        session.fire_reconnect(id);
                    }
                });

                state.reconnect_timer = Some(ReconnectTimer { id, handle });
                self.transition(state, ConnectionEvent::ReconnectScheduled { attempt, delay });
            }
            ReconnectionDecision::AlreadyScheduled => {
                debug!(target: "mqtt_transport", "Reconnect already scheduled");
            }
            ReconnectionDecision::AbortManualDisconnect => {
                debug!(target: "mqtt_transport", "Manual disconnect, not reconnecting");
            }
        }
    }

    fn fire_reconnect(self: &Arc<Self>, timer_id: u64) {
        let mut state = self.lock_state();
        if state.manual_disconnect
            || state.reconnect_timer.as_ref().map(|timer| timer.id) != Some(timer_id)
        {
            debug!(target: "mqtt_transport", "Reconnect timer {} no longer current", timer_id);
            return;
        }
        // Dropping the handle detaches this task instead of aborting it.
        state.reconnect_timer = None;

        let attempt = state.attempts;
        self.transition(&mut state, ConnectionEvent::ReconnectStarted(attempt));

        match state.connection.clone() {
            Some(connection) => match connection.reconnect() {
                Ok(()) => info!("Reconnect attempt {} started", attempt),
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", attempt, e);
                    self.schedule_reconnect(&mut state);
                }
            },
            None => {
                info!("Reconnect attempt {}: opening new connection", attempt);
                self.open_connection(&mut state);
            }
        }
    }
}

/// Resubscribe `patterns` one at a time on the connection of `generation`
///
/// Stops as soon as that connection is replaced, lost or manually closed.
async fn resubscribe_all(
    session: Weak<SessionInner>,
    generation: u64,
    connection: Arc<dyn ProtocolConnection>,
    patterns: Vec<(String, QoS)>,
) {
    for (pattern, qos) in patterns {
        let current = session
            .upgrade()
            .is_some_and(|session| session.is_current(generation));
        if !current || !connection.is_connected() {
            debug!(target: "mqtt_transport", "Connection changed, abandoning resubscription");
            return;
        }

        match connection.subscribe(&pattern, qos).await {
            Ok(()) => debug!(target: "mqtt_transport", "Re-subscribed to: {}", pattern),
            Err(e) => warn!("Failed to re-subscribe to {}: {}", pattern, e),
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = state.reconnect_timer.take() {
            timer.handle.abort();
        }
        state.cancel_resubscription();
    }
}
