//! Thread-safe metrics collection
//!
//! Atomic counters for the HTTP front door and the broker connection, plus
//! a bounded window of publish latencies.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Number of publish latencies kept for percentile calculation
const LATENCY_WINDOW: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and a mutex-protected window
pub struct MetricsCollector {
    // HTTP front door
    http_requests: AtomicU64,
    invalid_bodies: AtomicU64,

    // Broker connection
    mqtt_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connections_lost: AtomicU64,
    reconnect_attempts: AtomicU64,
    connection_start_time: AtomicU64,

    // Publishing
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    publish_latencies: Mutex<VecDeque<u64>>, // milliseconds

    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            http_requests: AtomicU64::new(0),
            invalid_bodies: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            publish_latencies: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // HTTP metrics
    pub fn http_request_received(&self) {
        self.http_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn http_invalid_body(&self) {
        self.invalid_bodies.fetch_add(1, Ordering::Relaxed);
    }

    // MQTT metrics
    pub fn mqtt_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn mqtt_connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_message_published(&self, latency: Duration) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
        self.record_publish_latency(latency);
    }

    pub fn mqtt_publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_publish_latency(&self, latency: Duration) {
        if let Ok(mut latencies) = self.publish_latencies.lock() {
            if latencies.len() == LATENCY_WINDOW {
                latencies.pop_front();
            }
            latencies.push_back(latency.as_millis() as u64);
        }
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.http_requests,
            &self.invalid_bodies,
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.connections_lost,
            &self.reconnect_attempts,
            &self.connection_start_time,
            &self.messages_published,
            &self.publish_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut latencies) = self.publish_latencies.lock() {
            latencies.clear();
        }
    }

    /// Average, p50 and p95 publish latency
    fn publish_latency_statistics(&self) -> (f64, f64, f64) {
        match self.publish_latencies.lock() {
            Ok(latencies) if !latencies.is_empty() => {
                let mut sorted: Vec<u64> = latencies.iter().copied().collect();
                sorted.sort_unstable();
                let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
                (avg, percentile(&sorted, 50.0), percentile(&sorted, 95.0))
            }
            _ => (0.0, 0.0, 0.0),
        }
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg, p50, p95) = self.publish_latency_statistics();

        let connection_start = self.connection_start_time.load(Ordering::Relaxed);
        let connection_duration_seconds = if connection_start > 0 {
            now.saturating_sub(connection_start)
        } else {
            0
        };

        MetricsSnapshot {
            http: HttpMetrics {
                requests: self.http_requests.load(Ordering::Relaxed),
                invalid_bodies: self.invalid_bodies.load(Ordering::Relaxed),
            },
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                connections_lost: self.connections_lost.load(Ordering::Relaxed),
                reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                avg_publish_latency_ms: avg,
                publish_latency_p50_ms: p50,
                publish_latency_p95_ms: p95,
                connection_duration_seconds,
            },
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub http: HttpMetrics,
    pub mqtt: MqttMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct HttpMetrics {
    pub requests: u64,
    pub invalid_bodies: u64,
}

#[derive(Debug, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connections_lost: u64,
    pub reconnect_attempts: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub avg_publish_latency_ms: f64,
    pub publish_latency_p50_ms: f64,
    pub publish_latency_p95_ms: f64,
    pub connection_duration_seconds: u64,
}

/// Seconds since the Unix epoch
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Nearest-rank percentile over sorted data
fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }
    let index = (percentile / 100.0 * (sorted_data.len() - 1) as f64).round() as usize;
    sorted_data[index.min(sorted_data.len() - 1)] as f64
}
