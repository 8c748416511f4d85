//! Pure health monitoring and reconnection logic for the MQTT session
//!
//! This module contains pure functions for state transitions, reconnection
//! decision making and connection health metrics. The session calls into it and
//! owns all the mutable state.

use super::backoff::BackoffPolicy;
use super::connection::{ConnectionState, MqttError};
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether a connection loss should arm a reconnect timer (pure function)
    pub fn should_schedule_reconnect(
        current_attempts: u32,
        backoff: &BackoffPolicy,
        manual_disconnect: bool,
        timer_pending: bool,
    ) -> ReconnectionDecision {
        if manual_disconnect {
            return ReconnectionDecision::AbortManualDisconnect;
        }
        if timer_pending {
            return ReconnectionDecision::AlreadyScheduled;
        }

        let attempt = current_attempts.saturating_add(1);
        ReconnectionDecision::Proceed {
            attempt,
            delay: backoff.delay(attempt),
        }
    }

    /// Publishing needs a connection whose transport is live (pure function)
    pub fn check_publish_allowed<C>(
        live_connection: Option<C>,
        state: &ConnectionState,
    ) -> Result<C, MqttError> {
        live_connection.ok_or_else(|| MqttError::NotConnected {
            state: state.clone(),
        })
    }

    /// Determine next state after a session event (pure function)
    pub fn determine_next_state(event: &ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::OpenStarted => ConnectionState::Connecting,
            ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
            ConnectionEvent::ReconnectScheduled { attempt, delay } => {
                ConnectionState::ReconnectScheduled {
                    attempt: *attempt,
                    delay: *delay,
                }
            }
            ConnectionEvent::ReconnectStarted(_) => ConnectionState::Connecting,
            ConnectionEvent::ManualDisconnect => ConnectionState::Disconnected,
        }
    }

    /// Calculate health metrics for the session (pure function)
    pub fn calculate_health_metrics(stats: &SessionStats) -> HealthMetrics {
        let now = Instant::now();

        let uptime = stats.connect_time.map(|t| now.duration_since(t));
        let time_since_last_message = stats.last_message_time.map(|t| now.duration_since(t));

        HealthMetrics {
            uptime,
            time_since_last_message,
            connected_at: stats.connected_at,
            reconnect_count: stats.reconnect_count,
            messages_dispatched: stats.messages_dispatched,
            handler_failures: stats.handler_failures,
            is_healthy: uptime.is_some(),
        }
    }

    /// Log connection state transition (pure logging function)
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("MQTT connection established");
            }
            (
                ConnectionState::ReconnectScheduled { attempt, .. },
                ConnectionState::Connecting,
            ) => {
                info!("Starting reconnection attempt {}", attempt);
            }
            (_, ConnectionState::ReconnectScheduled { attempt, delay }) => {
                warn!(
                    "MQTT connection unavailable, reconnect attempt {} in {:?}",
                    attempt, delay
                );
            }
            (_, ConnectionState::Disconnected) => {
                info!("MQTT session disconnected");
            }
            _ => {
                debug!("MQTT connection state: {} -> {}", from, to);
            }
        }
    }
}

/// Decision result for reconnect scheduling
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Arm a timer for this attempt
    Proceed { attempt: u32, delay: Duration },
    /// Caller disconnected on purpose; never reconnect
    AbortManualDisconnect,
    /// A timer is already pending
    AlreadyScheduled,
}

/// Session events that trigger state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A new engine connection was opened
    OpenStarted,
    /// Engine reported the connection as established
    ConnAckReceived,
    /// Connection lost; a reconnect timer was armed
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// Reconnect timer fired
    ReconnectStarted(u32),
    /// Caller asked to disconnect
    ManualDisconnect,
}

/// Raw counters kept by the session
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub connect_time: Option<Instant>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_message_time: Option<Instant>,
    pub reconnect_count: u32,
    pub messages_dispatched: u64,
    pub handler_failures: u64,
}

/// Health metrics for connection monitoring
#[derive(Debug, Clone)]
pub struct HealthMetrics {
    /// Time since the current connection was established
    pub uptime: Option<Duration>,
    /// Time since last inbound message
    pub time_since_last_message: Option<Duration>,
    /// Wall-clock time of the current connection
    pub connected_at: Option<DateTime<Utc>>,
    /// Number of reconnects scheduled over the session's life
    pub reconnect_count: u32,
    pub messages_dispatched: u64,
    pub handler_failures: u64,
    /// Connected right now
    pub is_healthy: bool,
}
