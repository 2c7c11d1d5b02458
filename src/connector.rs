//! Broker connector
//!
//! [`Connector`] owns the single live broker session shared by every HTTP
//! request. The first caller triggers the initial connect; later callers
//! reuse the session. When the session drops, a supervised background task
//! reconnects according to the [`ReconnectConfig`] policy.
//!
//! Connection errors never reach callers. They are logged, counted and
//! retried; callers only see whether a publish went through.

use crate::config::MqttSection;
use crate::observability::metrics::metrics;
use crate::transport::mqtt::{
    ConnectionEvent, ConnectionState, HealthMonitor, MqttClient, MqttError, ReconnectConfig,
    ReconnectionDecision,
};
use crate::transport::{Session, Transport};
use bytes::Bytes;
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Body of `POST /mqtt`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub topic: String,
    pub payload: String,
}

/// Result of handing one request to the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    Failed(String),
}

impl PublishOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, PublishOutcome::Published)
    }
}

/// Shared owner of the broker session
pub struct Connector {
    transport: Arc<dyn Transport>,
    reconnect_config: ReconnectConfig,
    session: Mutex<Option<Arc<dyn Session>>>,
    /// Bumped on every installed session so stale watchers can be ignored
    generation: AtomicU64,
    init: OnceCell<()>,
    reconnect_lock: Mutex<()>,
    supervisor_running: AtomicBool,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    connected_since: std::sync::Mutex<Option<Instant>>,
}

impl Connector {
    pub fn new(transport: Arc<dyn Transport>, reconnect_config: ReconnectConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            transport,
            reconnect_config,
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
            init: OnceCell::new(),
            reconnect_lock: Mutex::new(()),
            supervisor_running: AtomicBool::new(false),
            state_tx,
            shutdown_tx,
            connected_since: std::sync::Mutex::new(None),
        })
    }

    /// Build a connector backed by the rumqttc transport
    pub fn from_config(config: &MqttSection) -> Result<Arc<Self>, MqttError> {
        let reconnect_config = ReconnectConfig::from_section(&config.reconnect);
        HealthMonitor::validate_reconnect_config(&reconnect_config)
            .map_err(MqttError::ConnectionFailedStr)?;
        match reconnect_config.calculate_max_total_time() {
            Some(budget_ms) => info!(
                max_attempts = ?reconnect_config.max_attempts,
                budget_ms = budget_ms,
                "Reconnect attempts are bounded"
            ),
            None => debug!(
                delay_ms = reconnect_config.sustained_delay,
                "Reconnecting without an attempt limit"
            ),
        }
        let transport = MqttClient::new(config.clone())?;
        Ok(Self::new(Arc::new(transport), reconnect_config))
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        HealthMonitor::can_publish(&self.state())
    }

    /// Watch connection state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn broker_url(&self) -> String {
        self.transport.broker_url()
    }

    /// How long the current session has been up
    pub fn uptime(&self) -> Option<Duration> {
        let since = self.connected_since.lock().ok().and_then(|guard| *guard);
        HealthMonitor::uptime(since)
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next.clone());
        if previous != next {
            HealthMonitor::log_state_transition(&previous, &next);
        }
    }

    fn set_connected_since(&self, since: Option<Instant>) {
        if let Ok(mut guard) = self.connected_since.lock() {
            *guard = since;
        }
    }

    async fn live_session(&self) -> Option<Arc<dyn Session>> {
        self.session
            .lock()
            .await
            .as_ref()
            .filter(|session| session.is_connected())
            .cloned()
    }

    /// Shared session, connecting on the very first call.
    ///
    /// Concurrent first callers all wait on the same connect attempt. Returns
    /// `None` while the broker is unreachable.
    pub async fn get_client(self: &Arc<Self>) -> Option<Arc<dyn Session>> {
        self.init.get_or_init(|| self.connect()).await;
        self.live_session().await
    }

    /// Try to connect once; on failure hand over to the reconnect supervisor
    pub async fn connect(self: &Arc<Self>) {
        let failure = {
            let _guard = self.reconnect_lock.lock().await;
            if self.is_shutdown() || self.live_session().await.is_some() {
                return;
            }

            self.set_state(HealthMonitor::determine_next_state(
                ConnectionEvent::ConnectStarted,
            ));
            info!(broker = %self.broker_url(), "Connecting to MQTT broker");

            match self.attempt_connect().await {
                Ok(()) => None,
                Err(e) => Some(e),
            }
        };

        if let Some(e) = failure {
            warn!(
                broker = %self.broker_url(),
                error = %e,
                "Initial MQTT connection failed, reconnecting in background"
            );
            self.set_state(HealthMonitor::determine_next_state(
                ConnectionEvent::NetworkError(e.to_string()),
            ));
            self.reconnect();
        }
    }

    async fn attempt_connect(self: &Arc<Self>) -> Result<(), MqttError> {
        metrics().mqtt_connection_attempt();
        match self.transport.connect().await {
            Ok(session) => {
                self.install_session(session).await;
                Ok(())
            }
            Err(e) => {
                metrics().mqtt_connection_failed();
                Err(e)
            }
        }
    }

    /// Swap in a freshly connected session and watch it for loss.
    ///
    /// The slot lock is held until the state reads `Connected`, so a
    /// concurrent `shutdown` either discards this session or tears it down.
    async fn install_session(self: &Arc<Self>, session: Arc<dyn Session>) {
        let mut slot = self.session.lock().await;
        if self.is_shutdown() {
            drop(slot);
            debug!("Shutdown in progress, discarding new session");
            if let Err(e) = session.disconnect().await {
                debug!(error = %e, "Disconnecting discarded session failed");
            }
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let state_rx = session.state();
        let previous = slot.replace(session);

        self.set_connected_since(Some(Instant::now()));
        self.set_state(HealthMonitor::determine_next_state(
            ConnectionEvent::ConnAckReceived,
        ));
        metrics().mqtt_connection_established();
        drop(slot);

        if let Some(previous) = previous {
            // Only reachable if a dead session was never cleared
            if let Err(e) = previous.disconnect().await {
                debug!(error = %e, "Disconnecting replaced session failed");
            }
        }

        let connector = Arc::downgrade(self);
        tokio::spawn(async move {
            let reason = Self::wait_for_loss(state_rx).await;
            if let Some(connector) = connector.upgrade() {
                if connector.generation.load(Ordering::Acquire) == generation {
                    connector.on_connection_lost(reason).await;
                }
            }
        });
    }

    async fn wait_for_loss(mut state_rx: watch::Receiver<ConnectionState>) -> String {
        loop {
            match &*state_rx.borrow_and_update() {
                ConnectionState::Disconnected(reason)
                | ConnectionState::PermanentlyDisconnected(reason) => return reason.clone(),
                _ => {}
            }
            if state_rx.changed().await.is_err() {
                return "session state channel closed".to_string();
            }
        }
    }

    /// Called when the live session drops
    pub async fn on_connection_lost(self: &Arc<Self>, reason: String) {
        if self.is_shutdown() {
            debug!(reason = %reason, "Connection closed during shutdown");
            return;
        }

        warn!(broker = %self.broker_url(), reason = %reason, "MQTT connection lost");
        metrics().mqtt_connection_lost();

        self.session.lock().await.take();
        self.set_connected_since(None);
        self.set_state(HealthMonitor::determine_next_state(
            ConnectionEvent::NetworkError(reason),
        ));
        self.reconnect();
    }

    /// Start the reconnect supervisor unless one is already running.
    ///
    /// Returns the supervisor task when one was started.
    pub fn reconnect(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.supervisor_running.swap(true, Ordering::AcqRel) {
            debug!("Reconnect supervisor already running");
            return None;
        }

        let connector = Arc::clone(self);
        let span = crate::mqtt_span!(operation = "reconnect", broker = %self.broker_url());
        Some(tokio::spawn(
            async move { connector.run_supervisor().await }.instrument(span),
        ))
    }

    async fn run_supervisor(self: Arc<Self>) {
        loop {
            self.supervise().await;
            self.supervisor_running.store(false, Ordering::Release);

            // A loss reported while the supervisor was finishing is picked up here
            if self.is_shutdown()
                || HealthMonitor::is_terminal(&self.state())
                || self.live_session().await.is_some()
            {
                break;
            }
            if self.supervisor_running.swap(true, Ordering::AcqRel) {
                break;
            }
        }
    }

    async fn supervise(self: &Arc<Self>) {
        let _guard = self.reconnect_lock.lock().await;
        if self.live_session().await.is_some() {
            debug!("Already connected, nothing to reconnect");
            return;
        }

        let shutdown_rx = self.shutdown_tx.subscribe();
        let mut attempts = 0u32;

        loop {
            let shutdown_requested = *shutdown_rx.borrow();
            match HealthMonitor::should_attempt_reconnection(
                attempts,
                &self.reconnect_config,
                shutdown_requested,
            ) {
                ReconnectionDecision::AbortShutdownRequested => {
                    info!("Shutdown requested, stopping reconnect supervisor");
                    return;
                }
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    let reason = format!("gave up after {attempts} reconnect attempts");
                    self.set_state(HealthMonitor::determine_next_state(
                        ConnectionEvent::PermanentFailure(reason),
                    ));
                    return;
                }
                ReconnectionDecision::Proceed { attempt, delay_ms } => {
                    self.set_state(HealthMonitor::determine_next_state(
                        ConnectionEvent::ReconnectionStarted(attempt),
                    ));
                    metrics().mqtt_reconnect_attempt();

                    match self.attempt_connect().await {
                        Ok(()) => return,
                        Err(e) => {
                            warn!(
                                attempt = attempt,
                                retry_in_ms = delay_ms,
                                error = %e,
                                "Reconnect attempt failed"
                            );
                        }
                    }

                    attempts = attempt;
                    if !interruptible_sleep(shutdown_rx.clone(), delay_ms).await {
                        return;
                    }
                }
            }
        }
    }

    /// Publish one request at QoS 0 without retain
    pub async fn publish(self: &Arc<Self>, request: &PublishRequest) -> PublishOutcome {
        let Some(session) = self.get_client().await else {
            let reason = format!("broker not connected ({})", self.state().label());
            metrics().mqtt_publish_failed();
            warn!(topic = %request.topic, reason = %reason, "Dropping publish");
            return PublishOutcome::Failed(reason);
        };

        let started = Instant::now();
        let payload = Bytes::from(request.payload.clone());
        match session
            .publish(&request.topic, payload, QoS::AtMostOnce, false)
            .await
        {
            Ok(()) => {
                metrics().mqtt_message_published(started.elapsed());
                debug!(topic = %request.topic, bytes = request.payload.len(), "Published");
                PublishOutcome::Published
            }
            Err(e) => {
                metrics().mqtt_publish_failed();
                warn!(topic = %request.topic, error = %e, "Publish failed");
                PublishOutcome::Failed(e.to_string())
            }
        }
    }

    /// Stop the supervisor and close the live session
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }

        let session = self.session.lock().await.take();
        if let Some(session) = session {
            if let Err(e) = session.disconnect().await {
                error!(error = %e, "Failed to disconnect from MQTT broker");
            }
        }

        self.set_connected_since(None);
        self.set_state(ConnectionState::Disconnected("shutdown".to_string()));
        info!("MQTT connector stopped");
    }
}

/// Sleep that ends early on shutdown.
/// Returns true if the full delay elapsed.
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
    if *shutdown_rx.borrow_and_update() {
        return false;
    }
    tokio::select! {
        changed = shutdown_rx.changed() => {
            if changed.is_err() {
                return true;
            }
            !*shutdown_rx.borrow()
        }
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockTransport;

    fn fast_reconnect(max_attempts: Option<u32>) -> ReconnectConfig {
        ReconnectConfig {
            max_attempts,
            backoff_pattern: Vec::new(),
            sustained_delay: 10,
        }
    }

    async fn wait_for_state(
        connector: &Connector,
        predicate: impl Fn(&ConnectionState) -> bool,
    ) -> ConnectionState {
        let mut state_rx = connector.subscribe_state();
        let state = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let state = state_rx.borrow_and_update().clone();
                if predicate(&state) {
                    return state;
                }
                if state_rx.changed().await.is_err() {
                    return state;
                }
            }
        })
        .await;
        state.unwrap_or_else(|_| connector.state())
    }

    #[test]
    fn test_publish_request_decoding() {
        let request: PublishRequest =
            serde_json::from_str(r#"{"topic":"sensors/temp","payload":"21.5"}"#).unwrap();
        assert_eq!(request.topic, "sensors/temp");
        assert_eq!(request.payload, "21.5");

        assert!(serde_json::from_str::<PublishRequest>(r#"{"topic":"a"}"#).is_err());
        assert!(serde_json::from_str::<PublishRequest>(r#"{"topic":1,"payload":"x"}"#).is_err());
    }

    #[tokio::test]
    async fn test_starts_idle_without_connecting() {
        let transport = MockTransport::new();
        let connector = Connector::new(Arc::new(transport.clone()), fast_reconnect(None));

        assert_eq!(connector.state(), ConnectionState::Idle);
        assert!(!connector.is_connected());
        assert_eq!(transport.connect_calls(), 0);
    }

    #[tokio::test]
    async fn test_get_client_connects_once() {
        let transport = MockTransport::new();
        let connector = Connector::new(Arc::new(transport.clone()), fast_reconnect(None));

        assert!(connector.get_client().await.is_some());
        assert!(connector.get_client().await.is_some());

        assert_eq!(transport.sessions_created(), 1);
        assert!(connector.is_connected());
        assert!(connector.uptime().is_some());
    }

    #[tokio::test]
    async fn test_publish_uses_qos0_without_retain() {
        let transport = MockTransport::new();
        let connector = Connector::new(Arc::new(transport.clone()), fast_reconnect(None));

        let outcome = connector
            .publish(&PublishRequest {
                topic: "sensors/temp".to_string(),
                payload: "21.5".to_string(),
            })
            .await;

        assert_eq!(outcome, PublishOutcome::Published);
        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "sensors/temp");
        assert_eq!(published[0].payload, Bytes::from("21.5"));
        assert_eq!(published[0].qos, QoS::AtMostOnce);
        assert!(!published[0].retain);
    }

    #[tokio::test]
    async fn test_initial_failure_reconnects_in_background() {
        let transport = MockTransport::new().with_failures_before_success(2);
        let connector = Connector::new(Arc::new(transport.clone()), fast_reconnect(None));

        // First caller is not blocked by the retry loop
        assert!(connector.get_client().await.is_none());

        let state = wait_for_state(&connector, |s| *s == ConnectionState::Connected).await;
        assert_eq!(state, ConnectionState::Connected);
        assert_eq!(transport.connect_calls(), 3);
        assert_eq!(transport.sessions_created(), 1);
    }

    #[tokio::test]
    async fn test_publish_fails_while_disconnected() {
        let transport = MockTransport::new().with_failures_before_success(u32::MAX);
        let connector = Connector::new(Arc::new(transport.clone()), fast_reconnect(None));

        let outcome = connector
            .publish(&PublishRequest {
                topic: "t".to_string(),
                payload: "p".to_string(),
            })
            .await;

        assert!(matches!(outcome, PublishOutcome::Failed(_)));
        assert!(transport.published().is_empty());
        connector.shutdown().await;
    }

    #[tokio::test]
    async fn test_max_attempts_gives_up() {
        let transport = MockTransport::new().with_failures_before_success(u32::MAX);
        let connector = Connector::new(Arc::new(transport.clone()), fast_reconnect(Some(3)));

        connector.connect().await;

        let state = wait_for_state(&connector, HealthMonitor::is_terminal).await;
        assert!(matches!(state, ConnectionState::PermanentlyDisconnected(_)));
        // Initial attempt plus three reconnects
        assert_eq!(transport.connect_calls(), 4);
    }

    #[tokio::test]
    async fn test_connection_loss_triggers_reconnect() {
        let transport = MockTransport::new();
        let connector = Connector::new(Arc::new(transport.clone()), fast_reconnect(None));
        assert!(connector.get_client().await.is_some());

        transport.fail_next_connects(1);
        transport.drop_connections("broker restarted");

        tokio::time::timeout(Duration::from_secs(2), async {
            while transport.sessions_created() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("a replacement session should be created");
        let state = wait_for_state(&connector, |s| *s == ConnectionState::Connected).await;
        assert_eq!(state, ConnectionState::Connected);
        assert_eq!(transport.sessions_created(), 2);
    }

    #[tokio::test]
    async fn test_reconnect_is_single_flight() {
        let transport = MockTransport::new().with_failures_before_success(u32::MAX);
        let connector = Connector::new(Arc::new(transport), fast_reconnect(None));

        let first = connector.reconnect();
        let second = connector.reconnect();

        assert!(first.is_some());
        assert!(second.is_none());
        connector.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_supervisor() {
        let transport = MockTransport::new().with_failures_before_success(u32::MAX);
        let connector = Connector::new(
            Arc::new(transport.clone()),
            ReconnectConfig {
                max_attempts: None,
                backoff_pattern: Vec::new(),
                sustained_delay: 60_000,
            },
        );

        let supervisor = connector.reconnect().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        connector.shutdown().await;

        tokio::time::timeout(Duration::from_secs(1), supervisor)
            .await
            .expect("supervisor should stop promptly")
            .unwrap();
        assert!(!connector.is_connected());
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_session() {
        let transport = MockTransport::new();
        let connector = Connector::new(Arc::new(transport.clone()), fast_reconnect(None));
        assert!(connector.get_client().await.is_some());

        connector.shutdown().await;

        assert_eq!(
            connector.state(),
            ConnectionState::Disconnected("shutdown".to_string())
        );
        assert!(connector.get_client().await.is_none());
        assert_eq!(transport.sessions_created(), 1);
    }

    #[tokio::test]
    async fn test_interruptible_sleep() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        assert!(interruptible_sleep(shutdown_rx.clone(), 5).await);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = shutdown_tx.send(true);
        });
        assert!(!interruptible_sleep(shutdown_rx, 10_000).await);
    }
}
