//! rumqttc-backed MQTT transport
//!
//! This module separates pure functions from I/O operations for better
//! testability.
//!
//! # Architecture
//!
//! - [`connection`] - Connection state, reconnect policy and option building
//! - [`message_handler`] - Pure routing of rumqttc events for 3.1.1 and 5.0
//! - [`health_monitor`] - Pure reconnection decisions and state transitions
//! - [`client`] - Impure I/O: event loop driving and publishing
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_http_bridge::config::MqttSection;
//! use mqtt_http_bridge::transport::mqtt::MqttClient;
//! use mqtt_http_bridge::transport::Transport;
//!
//! # tokio_test::block_on(async {
//! let transport = MqttClient::new(MqttSection::default())?;
//! let session = transport.connect().await?;
//! session
//!     .publish("sensors/temp", "21.5".into(), rumqttc::QoS::AtMostOnce, false)
//!     .await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

// Re-export public types for convenience
pub use client::{MqttClient, MqttSession};
pub use connection::{ConnectionState, MqttError, ReconnectConfig};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageHandler};
