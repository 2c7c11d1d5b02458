//! Pure connection state management for the MQTT transport
//!
//! This module contains pure functions for connection state management,
//! reconnect policy and rumqttc option building.

use crate::config::{BrokerScheme, ConfigError, MqttSection, ReconnectSection};
use rumqttc::Transport as RumqttcTransport;
use rumqttc::{v5, MqttOptions, QoS};
use std::time::Duration;
use thiserror::Error;

/// Largest packet the bridge will send or accept
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Connection state for the broker connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// No connection has been requested yet
    Idle,
    /// Attempting to connect
    Connecting,
    /// Successfully connected and ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Permanently disconnected - max reconnection attempts exceeded
    PermanentlyDisconnected(String),
}

impl ConnectionState {
    /// Short label used in health output
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected(_) => "disconnected",
            ConnectionState::Reconnecting(_) => "reconnecting",
            ConnectionState::PermanentlyDisconnected(_) => "permanently_disconnected",
        }
    }
}

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Optional backoff pattern in milliseconds, applied before the sustained delay
    pub backoff_pattern: Vec<u64>,
    /// Delay to use once the pattern is exhausted (or when it is empty)
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: Vec::new(),
            sustained_delay: 5000,
        }
    }
}

impl ReconnectConfig {
    /// Build the policy from the environment-driven reconnect section
    pub fn from_section(section: &ReconnectSection) -> Self {
        Self {
            max_attempts: section.max_attempts,
            backoff_pattern: Vec::new(),
            sustained_delay: section.delay_secs.saturating_mul(1000),
        }
    }

    /// Calculate the maximum total time for all reconnection attempts
    /// Returns None if unlimited retries are configured
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }

    /// Delay after the given (1-based) failed attempt
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed: {0}")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publish not accepted within {timeout_secs}s")]
    PublishTimeout { timeout_secs: u64 },
    #[error("Invalid broker configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
}

/// Address handed to rumqttc: websocket transports take the full URL as host
pub fn broker_address(config: &MqttSection, scheme: BrokerScheme) -> (String, u16) {
    if scheme.is_websocket() {
        let ws_scheme = match scheme {
            BrokerScheme::Wss => "wss",
            _ => "ws",
        };
        (
            format!("{ws_scheme}://{}:{}/mqtt", config.host, config.port),
            config.port,
        )
    } else {
        (config.host.clone(), config.port)
    }
}

/// Select the rumqttc network transport for a scheme
pub fn build_transport(scheme: BrokerScheme) -> RumqttcTransport {
    match scheme {
        BrokerScheme::Tcp => RumqttcTransport::Tcp,
        BrokerScheme::Tls => RumqttcTransport::tls_with_default_config(),
        BrokerScheme::Ws => RumqttcTransport::Ws,
        BrokerScheme::Wss => RumqttcTransport::wss_with_default_config(),
    }
}

/// Pure function to configure MQTT 3.1.x options from config
pub fn configure_mqtt_options(config: &MqttSection) -> Result<MqttOptions, MqttError> {
    let scheme = config.broker_scheme()?;
    let (host, port) = broker_address(config, scheme);

    let mut mqtt_options = MqttOptions::new(config.client_id.clone(), host, port);
    mqtt_options.set_transport(build_transport(scheme));
    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    mqtt_options.set_clean_session(true);
    mqtt_options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

    if let Some(username) = &config.username {
        let password = config.password.clone().unwrap_or_default();
        mqtt_options.set_credentials(username.clone(), password);
    }

    Ok(mqtt_options)
}

/// Pure function to configure MQTT 5.0 options from config
pub fn configure_mqtt5_options(config: &MqttSection) -> Result<v5::MqttOptions, MqttError> {
    let scheme = config.broker_scheme()?;
    let (host, port) = broker_address(config, scheme);

    let mut mqtt_options = v5::MqttOptions::new(config.client_id.clone(), host, port);
    mqtt_options.set_transport(build_transport(scheme));
    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    mqtt_options.set_clean_start(true);
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE as u32));

    if let Some(username) = &config.username {
        let password = config.password.clone().unwrap_or_default();
        mqtt_options.set_credentials(username.clone(), password);
    }

    Ok(mqtt_options)
}

/// Map a 3.1.x QoS level onto its 5.0 counterpart
pub fn to_v5_qos(qos: QoS) -> v5::mqttbytes::QoS {
    match qos {
        QoS::AtMostOnce => v5::mqttbytes::QoS::AtMostOnce,
        QoS::AtLeastOnce => v5::mqttbytes::QoS::AtLeastOnce,
        QoS::ExactlyOnce => v5::mqttbytes::QoS::ExactlyOnce,
    }
}
