//! mqtt-http-bridge
//!
//! Accepts `POST /mqtt` requests carrying `{"topic": ..., "payload": ...}`
//! and republishes them onto a single long-lived MQTT broker connection.
//!
//! The broker connection is opened lazily by the first request and rebuilt
//! in the background whenever it drops, so HTTP callers never see
//! connection errors.
//!
//! # Quick Start
//!
//! ```rust
//! use mqtt_http_bridge::connector::{Connector, PublishOutcome, PublishRequest};
//! use mqtt_http_bridge::testing::MockTransport;
//! use mqtt_http_bridge::transport::mqtt::ReconnectConfig;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let transport = MockTransport::new();
//! let connector = Connector::new(Arc::new(transport.clone()), ReconnectConfig::default());
//!
//! let outcome = connector
//!     .publish(&PublishRequest {
//!         topic: "sensors/temp".to_string(),
//!         payload: "21.5".to_string(),
//!     })
//!     .await;
//!
//! assert_eq!(outcome, PublishOutcome::Published);
//! assert_eq!(transport.published()[0].topic, "sensors/temp");
//! # });
//! ```

pub mod config;
pub mod connector;
pub mod error;
pub mod http;
pub mod observability;
pub mod testing;
pub mod transport;

pub use config::{BridgeConfig, ConfigError, MqttSection, ProtocolVersion};
pub use connector::{Connector, PublishOutcome, PublishRequest};
pub use error::{BridgeError, BridgeResult};
pub use transport::mqtt::{ConnectionState, MqttClient};
