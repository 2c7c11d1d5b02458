//! Logging and metrics
//!
//! Structured logging through `tracing` and process-wide counters exposed on
//! the `/metrics` route.

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, LogFormat, LogSettings};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{http_span, mqtt_span};
