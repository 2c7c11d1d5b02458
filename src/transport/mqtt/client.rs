//! Impure I/O operations for the MQTT transport
//!
//! [`MqttClient`] builds rumqttc clients for the configured protocol
//! version and drives their event loops. Each successful connect yields one
//! [`MqttSession`]; when its event loop fails the session is finished and
//! the connector asks for a new one.

use super::connection::{
    configure_mqtt5_options, configure_mqtt_options, to_v5_qos, ConnectionState, MqttError,
};
use super::health_monitor::{ConnectionEvent, HealthMonitor};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::MqttSection;
use crate::transport::{Session, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{v5, AsyncClient, EventLoop, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Capacity of the request channel between client handle and event loop
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// rumqttc-backed [`Transport`]
pub struct MqttClient {
    config: MqttSection,
}

/// Client handle for whichever protocol version was negotiated
#[derive(Clone)]
enum ClientHandle {
    V311(AsyncClient),
    V5(v5::AsyncClient),
}

/// One connected rumqttc client and its event loop driver
pub struct MqttSession {
    client: ClientHandle,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    driver: JoinHandle<()>,
    publish_timeout: Duration,
}

impl MqttClient {
    /// Create a transport for the given broker settings
    pub fn new(config: MqttSection) -> Result<Self, MqttError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Broker settings this transport connects with
    pub fn config(&self) -> &MqttSection {
        &self.config
    }

    /// Create connection state and shutdown channels
    #[allow(clippy::type_complexity)]
    fn setup_connection_channels() -> (
        (
            watch::Sender<ConnectionState>,
            watch::Receiver<ConnectionState>,
        ),
        (watch::Sender<bool>, watch::Receiver<bool>),
    ) {
        let state_channels = watch::channel(ConnectionState::Connecting);
        let shutdown_channels = watch::channel(false);
        (state_channels, shutdown_channels)
    }

    /// Wait until the driver reports CONNACK, a failure, or the timeout expires
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailedStr(
                        "State channel closed".to_string(),
                    ));
                }
                match *state_rx.borrow() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(ref reason) => {
                        return Err(MqttError::ConnectionFailedStr(reason.clone()));
                    }
                    ConnectionState::PermanentlyDisconnected(ref reason) => {
                        return Err(MqttError::ConnectionFailedStr(format!(
                            "Permanently disconnected: {reason}"
                        )));
                    }
                    ConnectionState::Idle
                    | ConnectionState::Connecting
                    | ConnectionState::Reconnecting(_) => continue,
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(MqttError::ConnectionFailedStr(format!(
                "ConnAck timeout - no connection confirmation within {}s",
                timeout.as_secs()
            ))),
        }
    }

    /// Apply a routed event to the session state.
    /// Returns false when the driver loop should stop.
    fn apply_route(route: EventRoute, state_tx: &watch::Sender<ConnectionState>) -> bool {
        let keep_running = !MessageHandler::ends_session(&route);
        match route {
            EventRoute::ConnectionAcknowledged => {
                let _ = state_tx.send(HealthMonitor::determine_next_state(
                    ConnectionEvent::ConnAckReceived,
                ));
            }
            EventRoute::Disconnected => {
                let _ = state_tx.send(HealthMonitor::determine_next_state(
                    ConnectionEvent::DisconnectedByBroker,
                ));
            }
            EventRoute::PublishAcknowledged { packet_id } => {
                debug!(packet_id = packet_id, "Broker acknowledged publish");
            }
            EventRoute::InfrastructureEvent(description) => {
                trace!(event = %description, "MQTT infrastructure event");
            }
            EventRoute::OutgoingEvent => {}
        }
        keep_running
    }

    fn report_network_error(state_tx: &watch::Sender<ConnectionState>, error: String) {
        warn!(error = %error, "MQTT event loop error");
        let _ = state_tx.send(HealthMonitor::determine_next_state(
            ConnectionEvent::NetworkError(error),
        ));
    }

    fn report_closed(state_tx: &watch::Sender<ConnectionState>) {
        state_tx.send_if_modified(|state| {
            if matches!(state, ConnectionState::Disconnected(_)) {
                return false;
            }
            *state = ConnectionState::Disconnected("session closed".to_string());
            true
        });
    }

    fn spawn_driver(
        mut event_loop: EventLoop,
        state_tx: watch::Sender<ConnectionState>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    event = event_loop.poll() => match event {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            if !Self::apply_route(route, &state_tx) {
                                break;
                            }
                        }
                        Err(e) => {
                            Self::report_network_error(&state_tx, e.to_string());
                            break;
                        }
                    }
                }
            }
            Self::report_closed(&state_tx);
            debug!("MQTT event loop stopped");
        })
    }

    fn spawn_v5_driver(
        mut event_loop: v5::EventLoop,
        state_tx: watch::Sender<ConnectionState>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    event = event_loop.poll() => match event {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt5_event(&event);
                            if !Self::apply_route(route, &state_tx) {
                                break;
                            }
                        }
                        Err(e) => {
                            Self::report_network_error(&state_tx, e.to_string());
                            break;
                        }
                    }
                }
            }
            Self::report_closed(&state_tx);
            debug!("MQTT v5 event loop stopped");
        })
    }
}

#[async_trait]
impl Transport for MqttClient {
    async fn connect(&self) -> Result<Arc<dyn Session>, MqttError> {
        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) =
            Self::setup_connection_channels();

        let (client, driver) = if self.config.protocol_version.is_v5() {
            let options = configure_mqtt5_options(&self.config)?;
            let (client, event_loop) = v5::AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
            let driver = Self::spawn_v5_driver(event_loop, state_tx, shutdown_rx);
            (ClientHandle::V5(client), driver)
        } else {
            let options = configure_mqtt_options(&self.config)?;
            let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
            let driver = Self::spawn_driver(event_loop, state_tx, shutdown_rx);
            (ClientHandle::V311(client), driver)
        };

        // Dropping the session on failure aborts the driver
        let session = MqttSession {
            client,
            state_rx: state_rx.clone(),
            shutdown_tx,
            driver,
            publish_timeout: Duration::from_secs(self.config.publish_timeout_secs),
        };

        Self::wait_for_connection_confirmation(
            state_rx,
            Duration::from_secs(self.config.connect_timeout_secs),
        )
        .await?;

        info!(
            broker = %self.config.broker_url(),
            client_id = %self.config.client_id,
            requested_protocol_level = self.config.protocol_version.level(),
            wire_protocol_level = self.config.protocol_version.wire_level(),
            "Connected to MQTT broker"
        );
        Ok(Arc::new(session))
    }

    fn broker_url(&self) -> String {
        self.config.broker_url()
    }
}

#[async_trait]
impl Session for MqttSession {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError> {
        let state = self.state_rx.borrow().clone();
        if !HealthMonitor::can_publish(&state) {
            return Err(MqttError::NotConnected { state });
        }

        let request = async {
            match &self.client {
                ClientHandle::V311(client) => client
                    .publish_bytes(topic, qos, retain, payload)
                    .await
                    .map_err(|e| MqttError::PublishFailed(Box::new(e))),
                ClientHandle::V5(client) => client
                    .publish(topic.to_string(), to_v5_qos(qos), retain, payload)
                    .await
                    .map_err(|e| MqttError::PublishFailed(Box::new(e))),
            }
        };

        tokio::time::timeout(self.publish_timeout, request)
            .await
            .map_err(|_| MqttError::PublishTimeout {
                timeout_secs: self.publish_timeout.as_secs(),
            })?
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        let result = match &self.client {
            ClientHandle::V311(client) => client
                .disconnect()
                .await
                .map_err(|e| MqttError::ConnectionFailed(Box::new(e))),
            ClientHandle::V5(client) => client
                .disconnect()
                .await
                .map_err(|e| MqttError::ConnectionFailed(Box::new(e))),
        };

        // Give the driver a moment to flush DISCONNECT before stopping it
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = self.shutdown_tx.send(true);
        result
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.driver.abort();
    }
}
