//! Structured logging built on `tracing-subscriber`
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG or TRACE (default INFO)
//! - `LOG_FORMAT`: json, pretty or compact (default json)
//! - `LOG_SPANS`: emit span open/close events (default false)
//! - `RUST_LOG`: full filter override in env_logger syntax
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG ./mqtt-http-bridge run
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies that are too chatty at the bridge's own level
const QUIET_TARGETS: &[&str] = &["rumqttc", "hyper", "warp", "tokio"];

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Machine-readable JSON lines
    Json,
    /// Multi-line, coloured output for development
    Pretty,
    /// Single-line coloured output
    Compact,
}

impl LogFormat {
    /// Parse log format from string, defaulting to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Resolved logging settings
#[derive(Debug, Clone, PartialEq)]
pub struct LogSettings {
    pub level: Level,
    pub format: LogFormat,
    pub include_spans: bool,
}

impl LogSettings {
    /// Read settings from `LOG_LEVEL`, `LOG_FORMAT` and `LOG_SPANS`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            level: parse_level(&lookup("LOG_LEVEL").unwrap_or_default()),
            format: LogFormat::parse(&lookup("LOG_FORMAT").unwrap_or_default()),
            include_spans: lookup("LOG_SPANS")
                .map(|value| value.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    /// Raise the level by CLI verbosity (`-v` debug, `-vv` trace)
    pub fn with_verbosity(mut self, verbose: u8) -> Self {
        self.level = match verbose {
            0 => self.level,
            1 => self.level.max(Level::DEBUG),
            _ => Level::TRACE,
        };
        self
    }
}

/// Map a level name onto a tracing level; unknown names mean INFO
pub fn parse_level(value: &str) -> Level {
    match value.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Build the filter for a level, letting `RUST_LOG` take over when set
pub fn build_filter(level: Level, rust_log: Option<&str>) -> EnvFilter {
    if let Some(directives) = rust_log.filter(|value| !value.trim().is_empty()) {
        return EnvFilter::new(directives);
    }

    let mut directives = vec![level.to_string().to_lowercase()];
    directives.extend(QUIET_TARGETS.iter().map(|target| format!("{target}=warn")));
    EnvFilter::new(directives.join(","))
}

fn span_events(include_spans: bool) -> FmtSpan {
    if include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

/// Install the global subscriber.
///
/// A second call is a no-op, so tests may call this freely.
pub fn init_logging(settings: &LogSettings) {
    let filter = build_filter(settings.level, env::var("RUST_LOG").ok().as_deref());
    let subscriber = tracing_subscriber::registry().with(filter);
    let spans = span_events(settings.include_spans);

    let result = match settings.format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_span_events(spans))
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(fmt::layer().pretty().with_ansi(true).with_span_events(spans))
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(spans),
            )
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("Global subscriber already installed");
    }
}

/// Initialize logging from environment variables
pub fn init_default_logging() {
    init_logging(&LogSettings::from_env());
}

/// Create an MQTT operation span
#[macro_export]
macro_rules! mqtt_span {
    ($($field:tt)*) => {
        tracing::info_span!("mqtt_operation", $($field)*)
    };
}

/// Create an HTTP request span
#[macro_export]
macro_rules! http_span {
    ($($field:tt)*) => {
        tracing::info_span!("http_request", $($field)*)
    };
}

pub use crate::{http_span, mqtt_span};
