//! Crate-level error types
//!
//! Each layer keeps its own `thiserror` enum (`ConfigError`, `MqttError`);
//! [`BridgeError`] wraps them for the binary and the HTTP front door.

use crate::config::ConfigError;
use crate::transport::mqtt::MqttError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

const MAX_MESSAGE_LEN: usize = 500;

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passwd|token|key|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

static URL_CREDENTIALS_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"://[^/\s:@]+:[^/\s@]+@").expect("url credentials pattern is valid")
});

/// Main error type for bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] MqttError),

    #[error("HTTP server error: {0}")]
    Server(#[from] warp::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl BridgeError {
    pub fn invalid_request<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Error text with credentials stripped, safe to log or return
    pub fn public_message(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

/// Strip credentials from an error message and bound its length
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();

    sanitized = URL_CREDENTIALS_PATTERN
        .replace_all(&sanitized, "://***@")
        .to_string();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
