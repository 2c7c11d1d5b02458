//! Reconnection decisions and connection state transitions
//!
//! Everything here is a pure function so the connector's supervisor loop
//! can stay a thin shell around it.

use super::connection::{ConnectionState, ReconnectConfig};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether another reconnection attempt should be made.
    /// `max_attempts: None` retries forever.
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = current_attempts.saturating_add(1);
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: config.calculate_backoff_delay(attempt),
        }
    }

    /// Determine next state after connection event
    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnectStarted => ConnectionState::Connecting,
            ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
            ConnectionEvent::DisconnectedByBroker => {
                ConnectionState::Disconnected("broker sent disconnect".to_string())
            }
            ConnectionEvent::NetworkError(reason) => ConnectionState::Disconnected(reason),
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
            ConnectionEvent::PermanentFailure(reason) => {
                ConnectionState::PermanentlyDisconnected(reason)
            }
        }
    }

    /// Only a live connection accepts publishes
    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// True once the supervisor has given up for good
    pub fn is_terminal(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::PermanentlyDisconnected(_))
    }

    /// Uptime of the current connection, if any
    pub fn uptime(connected_since: Option<Instant>) -> Option<Duration> {
        connected_since.map(|since| since.elapsed())
    }

    /// Log connection state transition
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("MQTT connection established");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
                warn!(reason = %reason, "MQTT connection lost");
            }
            (ConnectionState::Reconnecting(attempt), ConnectionState::Connected) => {
                info!(attempt = attempt, "Reconnection successful");
            }
            (_, ConnectionState::Reconnecting(attempt)) => {
                info!(attempt = attempt, "Starting reconnection attempt");
            }
            (_, ConnectionState::PermanentlyDisconnected(reason)) => {
                error!(reason = %reason, "MQTT connection permanently failed");
            }
            _ => {
                info!(from = from.label(), to = to.label(), "MQTT connection state changed");
            }
        }
    }

    /// Validate reconnect policy
    pub fn validate_reconnect_config(config: &ReconnectConfig) -> Result<(), String> {
        if config.max_attempts == Some(0) {
            return Err("max_attempts must be greater than 0 or None for unlimited".to_string());
        }

        if config.sustained_delay == 0 {
            return Err("sustained_delay must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt
    Proceed { attempt: u32, delay_ms: u64 },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A connect attempt was started
    ConnectStarted,
    /// ConnAck received from broker
    ConnAckReceived,
    /// Broker initiated disconnect
    DisconnectedByBroker,
    /// Network or protocol error
    NetworkError(String),
    /// Reconnection attempt started
    ReconnectionStarted(u32),
    /// Permanent failure - no more retries
    PermanentFailure(String),
}
