//! Transport layer for broker communication
//!
//! The connector never talks to rumqttc directly. It asks a [`Transport`] for
//! a fresh [`Session`] whenever it needs a connection, which lets tests swap
//! in the mocks from [`crate::testing`].

use crate::transport::mqtt::{ConnectionState, MqttError};
use bytes::Bytes;
use rumqttc::QoS;
use std::sync::Arc;
use tokio::sync::watch;

pub mod mqtt;

/// Factory for broker sessions
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Open a new session and wait until the broker has acknowledged it
    async fn connect(&self) -> Result<Arc<dyn Session>, MqttError>;

    /// Broker URL used for logging
    fn broker_url(&self) -> String;
}

/// One live connection to the broker
///
/// A session never reconnects by itself. Once its state leaves
/// [`ConnectionState::Connected`] it is dead and the connector replaces it.
#[async_trait::async_trait]
pub trait Session: Send + Sync {
    /// Hand a message to the client and wait until it has been accepted
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError>;

    /// Disconnect gracefully from the broker
    async fn disconnect(&self) -> Result<(), MqttError>;

    /// Watch channel tracking this session's connection state
    fn state(&self) -> watch::Receiver<ConnectionState>;

    /// Check if the session is still connected
    fn is_connected(&self) -> bool {
        matches!(*self.state().borrow(), ConnectionState::Connected)
    }
}
