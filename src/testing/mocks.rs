//! Mock transport for testing
//!
//! [`MockTransport`] stands in for the broker: connects can be made to fail
//! a set number of times, live sessions can be dropped on demand, and every
//! publish is recorded for inspection.

use crate::transport::mqtt::{ConnectionState, MqttError};
use crate::transport::{Session, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// One publish seen by a mock session
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Default)]
struct MockState {
    connect_calls: AtomicU32,
    sessions_created: AtomicU32,
    remaining_failures: AtomicU32,
    fail_publish: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
    published: Mutex<Vec<PublishedMessage>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

/// Mock transport for testing; clones share state
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `attempts` connects, then succeed
    pub fn with_failures_before_success(self, attempts: u32) -> Self {
        self.fail_next_connects(attempts);
        self
    }

    /// Make every publish fail
    pub fn with_publish_failure(self) -> Self {
        self.state.fail_publish.store(true, Ordering::SeqCst);
        self
    }

    /// Hold each connect for `delay` before answering
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        if let Ok(mut guard) = self.state.connect_delay.lock() {
            *guard = Some(delay);
        }
        self
    }

    pub fn fail_next_connects(&self, attempts: u32) {
        self.state
            .remaining_failures
            .store(attempts, Ordering::SeqCst);
    }

    /// Simulate the broker dropping every live session
    pub fn drop_connections(&self, reason: &str) {
        let sessions = std::mem::take(&mut *self.state.sessions.lock().unwrap());
        for session in sessions {
            session.simulate_connection_loss(reason);
        }
    }

    /// Sessions handed out that are still connected
    pub fn live_sessions(&self) -> usize {
        let mut sessions = self.state.sessions.lock().unwrap();
        sessions.retain(|session| session.is_connected());
        sessions.len()
    }

    pub fn connect_calls(&self) -> u32 {
        self.state.connect_calls.load(Ordering::SeqCst)
    }

    pub fn sessions_created(&self) -> u32 {
        self.state.sessions_created.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.published.lock().unwrap().clone()
    }

    pub fn clear_history(&self) {
        self.state.published.lock().unwrap().clear();
    }

    fn take_failure(&self) -> bool {
        self.state
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<Arc<dyn Session>, MqttError> {
        self.state.connect_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.state.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.take_failure() {
            return Err(MqttError::ConnectionFailedStr(
                "Mock connection refused".to_string(),
            ));
        }

        let session = Arc::new(MockSession::new(Arc::clone(&self.state)));
        self.state.sessions_created.fetch_add(1, Ordering::SeqCst);
        let mut sessions = self.state.sessions.lock().unwrap();
        sessions.retain(|live| live.is_connected());
        sessions.push(Arc::clone(&session));
        drop(sessions);
        Ok(session)
    }

    fn broker_url(&self) -> String {
        "tcp://mock-broker:1883/mqtt".to_string()
    }
}

/// Session handed out by [`MockTransport`]
#[derive(Debug)]
pub struct MockSession {
    shared: Arc<MockState>,
    state_tx: watch::Sender<ConnectionState>,
}

impl MockSession {
    fn new(shared: Arc<MockState>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connected);
        Self { shared, state_tx }
    }

    /// Mark this session dead, as if the broker went away
    pub fn simulate_connection_loss(&self, reason: &str) {
        self.state_tx
            .send_replace(ConnectionState::Disconnected(reason.to_string()));
    }
}

#[async_trait]
impl Session for MockSession {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError> {
        let state = self.state_tx.borrow().clone();
        if state != ConnectionState::Connected {
            return Err(MqttError::NotConnected { state });
        }
        if self.shared.fail_publish.load(Ordering::SeqCst) {
            return Err(MqttError::PublishFailed("Mock publish failure".into()));
        }

        self.shared.published.lock().unwrap().push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        self.state_tx
            .send_replace(ConnectionState::Disconnected("client disconnect".to_string()));
        Ok(())
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }
}
