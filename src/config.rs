//! Environment-driven configuration for the bridge
//!
//! Every setting is read once at startup from the process environment,
//! optionally seeded from a local `.env` file. Unset or empty variables fall
//! back to the documented defaults; the resulting [`BridgeConfig`] is
//! immutable for the lifetime of the process.

use serde::{Deserialize, Serialize, Serializer};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;
use url::Url;

pub const DEFAULT_MQTT_HOST: &str = "localhost";
pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_MQTT_SCHEME: &str = "tcp";
pub const DEFAULT_APP_PORT: u16 = 3000;
pub const DEFAULT_ENV_FILE: &str = ".env";

/// Top-level bridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    pub mqtt: MqttSection,
    pub http: HttpSection,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker host (`MQTT_URL`)
    pub host: String,
    /// Broker port (`MQTT_PORT`)
    pub port: u16,
    /// Transport scheme as written in the broker URL (`MQTT_PROTOCOL`)
    pub scheme: String,
    /// Protocol version (`MQTT_PROTOCOL_VERSION`)
    pub protocol_version: ProtocolVersion,
    /// Client identifier presented to the broker
    pub client_id: String,
    pub username: Option<String>,
    #[serde(serialize_with = "redact_secret")]
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    /// How long a single connect attempt waits for CONNACK
    pub connect_timeout_secs: u64,
    /// How long a publish may wait for the client to accept it
    pub publish_timeout_secs: u64,
    pub reconnect: ReconnectSection,
}

/// Reconnect supervisor policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    /// Fixed delay between reconnect attempts
    pub delay_secs: u64,
    /// Attempt ceiling; `None` retries forever
    pub max_attempts: Option<u32>,
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpSection {
    /// Listen port (`APP_PORT`)
    pub port: u16,
    /// Answer 502 instead of 200 when the broker publish fails
    pub surface_publish_errors: bool,
}

/// MQTT protocol revision requested from the broker
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    /// MQTT 3.1 (protocol level 3)
    #[default]
    #[serde(rename = "3.1")]
    V31,
    /// MQTT 3.1.1 (protocol level 4)
    #[serde(rename = "3.1.1")]
    V311,
    /// MQTT 5.0 (protocol level 5)
    #[serde(rename = "5")]
    V5,
}

impl ProtocolVersion {
    /// Resolve the raw `MQTT_PROTOCOL_VERSION` value.
    ///
    /// The default is decided first; only a recognised level replaces it.
    pub fn resolve(raw: Option<&str>) -> Self {
        let mut version = ProtocolVersion::default();

        let level = raw.and_then(|value| value.trim().parse::<u32>().ok());
        match level {
            None | Some(0) => {}
            Some(3) => version = ProtocolVersion::V31,
            Some(4) => version = ProtocolVersion::V311,
            Some(5) => version = ProtocolVersion::V5,
            Some(other) => {
                warn!(
                    "Unsupported MQTT protocol version {}, falling back to {:?}",
                    other, version
                );
            }
        }

        version
    }

    /// Protocol level byte as sent in CONNECT
    pub fn level(&self) -> u8 {
        match self {
            ProtocolVersion::V31 => 3,
            ProtocolVersion::V311 => 4,
            ProtocolVersion::V5 => 5,
        }
    }

    /// Protocol level actually sent in CONNECT.
    ///
    /// rumqttc has no 3.1 client, so 3.1 goes out as 3.1.1 (level 4).
    pub fn wire_level(&self) -> u8 {
        match self {
            ProtocolVersion::V31 | ProtocolVersion::V311 => 4,
            ProtocolVersion::V5 => 5,
        }
    }

    pub fn is_v5(&self) -> bool {
        matches!(self, ProtocolVersion::V5)
    }
}

/// Network transport selected by the broker URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerScheme {
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl BrokerScheme {
    pub fn parse(scheme: &str) -> Option<Self> {
        match scheme.to_lowercase().as_str() {
            "tcp" | "mqtt" => Some(BrokerScheme::Tcp),
            "ssl" | "tls" | "tcps" | "mqtts" => Some(BrokerScheme::Tls),
            "ws" => Some(BrokerScheme::Ws),
            "wss" => Some(BrokerScheme::Wss),
            _ => None,
        }
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self, BrokerScheme::Ws | BrokerScheme::Wss)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load env file: {0}")]
    EnvFile(#[from] dotenv::Error),
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("Unsupported broker scheme: {0}")]
    UnsupportedScheme(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: DEFAULT_MQTT_HOST.to_string(),
            port: DEFAULT_MQTT_PORT,
            scheme: DEFAULT_MQTT_SCHEME.to_string(),
            protocol_version: ProtocolVersion::default(),
            client_id: generate_client_id(),
            username: None,
            password: None,
            keep_alive_secs: 30,
            connect_timeout_secs: 30,
            publish_timeout_secs: 10,
            reconnect: ReconnectSection::default(),
        }
    }
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            delay_secs: 5,
            max_attempts: None,
        }
    }
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            port: DEFAULT_APP_PORT,
            surface_publish_errors: false,
        }
    }
}

impl MqttSection {
    /// Broker URL in the `scheme://host:port/mqtt` form
    pub fn broker_url(&self) -> String {
        format!("{}://{}:{}/mqtt", self.scheme, self.host, self.port)
    }

    /// Transport selected by the configured scheme
    pub fn broker_scheme(&self) -> Result<BrokerScheme, ConfigError> {
        BrokerScheme::parse(&self.scheme)
            .ok_or_else(|| ConfigError::UnsupportedScheme(self.scheme.clone()))
    }

    /// Check that the assembled broker URL is usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker_scheme()?;

        let broker_url = self.broker_url();
        let url =
            Url::parse(&broker_url).map_err(|_| ConfigError::InvalidBrokerUrl(broker_url.clone()))?;
        if url.host_str().map_or(true, str::is_empty) {
            return Err(ConfigError::InvalidBrokerUrl(broker_url));
        }

        if self.client_id.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "client id must not be empty".to_string(),
            ));
        }
        if self.keep_alive_secs != 0 && self.keep_alive_secs < 5 {
            return Err(ConfigError::InvalidConfig(
                "keep alive must be 0 or at least 5 seconds".to_string(),
            ));
        }
        if self.connect_timeout_secs == 0 || self.publish_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "connect and publish timeouts must be greater than 0".to_string(),
            ));
        }
        if self.reconnect.delay_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect delay must be greater than 0".to_string(),
            ));
        }
        if self.reconnect.max_attempts == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "max reconnect attempts must be greater than 0 or unset".to_string(),
            ));
        }

        Ok(())
    }
}

impl BridgeConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        // Unparseable or zero port falls back to the default
        let port = var("MQTT_PORT")
            .and_then(|value| value.trim().parse::<u16>().ok())
            .filter(|port| *port != 0)
            .unwrap_or(DEFAULT_MQTT_PORT);

        let protocol_version = ProtocolVersion::resolve(var("MQTT_PROTOCOL_VERSION").as_deref());

        let reconnect = ReconnectSection {
            delay_secs: parse_var(&var, "MQTT_RECONNECT_DELAY_SECS")?.unwrap_or(5),
            max_attempts: parse_var(&var, "MQTT_RECONNECT_MAX_ATTEMPTS")?,
        };

        let mqtt = MqttSection {
            host: var("MQTT_URL").unwrap_or_else(|| DEFAULT_MQTT_HOST.to_string()),
            port,
            scheme: var("MQTT_PROTOCOL").unwrap_or_else(|| DEFAULT_MQTT_SCHEME.to_string()),
            protocol_version,
            client_id: var("MQTT_CLIENT_ID").unwrap_or_else(generate_client_id),
            username: var("MQTT_USERNAME"),
            password: var("MQTT_PASSWORD"),
            keep_alive_secs: parse_var(&var, "MQTT_KEEP_ALIVE_SECS")?.unwrap_or(30),
            connect_timeout_secs: parse_var(&var, "MQTT_CONNECT_TIMEOUT_SECS")?.unwrap_or(30),
            publish_timeout_secs: parse_var(&var, "MQTT_PUBLISH_TIMEOUT_SECS")?.unwrap_or(10),
            reconnect,
        };
        mqtt.validate()?;

        let http = HttpSection {
            port: parse_var(&var, "APP_PORT")?.unwrap_or(DEFAULT_APP_PORT),
            surface_publish_errors: var("HTTP_SURFACE_PUBLISH_ERRORS")
                .map(|value| parse_flag(&value))
                .unwrap_or(false),
        };

        Ok(Self { mqtt, http })
    }
}

/// Load variables from an env file without overriding ones already set.
///
/// Returns `Ok(false)` when the file does not exist.
pub fn load_env_file(path: &Path) -> Result<bool, ConfigError> {
    if !path.exists() {
        return Ok(false);
    }
    dotenv::from_path(path)?;
    Ok(true)
}

/// Generate a client id that fits the 23 byte MQTT 3.1 limit
pub fn generate_client_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("mqtt-http-bridge-{}", &suffix[..6])
}

fn parse_var<T, F>(var: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn redact_secret<S: Serializer>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(_) => serializer.serialize_some("***"),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_environment_empty() {
        let config = BridgeConfig::from_lookup(|_| None).unwrap();

        assert_eq!(config.mqtt.host, "localhost");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.scheme, "tcp");
        assert_eq!(config.mqtt.protocol_version, ProtocolVersion::V31);
        assert_eq!(config.mqtt.broker_url(), "tcp://localhost:1883/mqtt");
        assert_eq!(config.mqtt.reconnect.delay_secs, 5);
        assert_eq!(config.mqtt.reconnect.max_attempts, None);
        assert_eq!(config.http.port, 3000);
        assert!(!config.http.surface_publish_errors);
    }

    #[test]
    fn test_broker_url_from_environment() {
        let config = BridgeConfig::from_lookup(lookup_from(&[
            ("MQTT_URL", "broker.example"),
            ("MQTT_PORT", "8883"),
            ("MQTT_PROTOCOL", "ssl"),
        ]))
        .unwrap();

        assert_eq!(config.mqtt.broker_url(), "ssl://broker.example:8883/mqtt");
        assert_eq!(config.mqtt.broker_scheme().unwrap(), BrokerScheme::Tls);
    }

    #[test]
    fn test_empty_values_treated_as_unset() {
        let config = BridgeConfig::from_lookup(lookup_from(&[
            ("MQTT_URL", ""),
            ("MQTT_PROTOCOL", "  "),
            ("APP_PORT", ""),
        ]))
        .unwrap();

        assert_eq!(config.mqtt.broker_url(), "tcp://localhost:1883/mqtt");
        assert_eq!(config.http.port, 3000);
    }

    #[test]
    fn test_invalid_or_zero_mqtt_port_uses_default() {
        for raw in ["0", "not-a-port", "70000"] {
            let config = BridgeConfig::from_lookup(lookup_from(&[("MQTT_PORT", raw)])).unwrap();
            assert_eq!(config.mqtt.port, 1883, "Failed for MQTT_PORT={raw}");
        }
    }

    #[test]
    fn test_protocol_version_resolution() {
        assert_eq!(ProtocolVersion::resolve(None), ProtocolVersion::V31);
        assert_eq!(ProtocolVersion::resolve(Some("0")), ProtocolVersion::V31);
        assert_eq!(ProtocolVersion::resolve(Some("abc")), ProtocolVersion::V31);
        assert_eq!(ProtocolVersion::resolve(Some("3")), ProtocolVersion::V31);
        assert_eq!(ProtocolVersion::resolve(Some("4")), ProtocolVersion::V311);
        assert_eq!(ProtocolVersion::resolve(Some(" 5 ")), ProtocolVersion::V5);
        assert_eq!(ProtocolVersion::resolve(Some("7")), ProtocolVersion::V31);
    }

    #[test]
    fn test_protocol_version_levels() {
        assert_eq!(ProtocolVersion::V31.level(), 3);
        assert_eq!(ProtocolVersion::V311.level(), 4);
        assert_eq!(ProtocolVersion::V5.level(), 5);
        assert_eq!(ProtocolVersion::V31.wire_level(), 4);
        assert_eq!(ProtocolVersion::V311.wire_level(), 4);
        assert_eq!(ProtocolVersion::V5.wire_level(), 5);
        assert!(ProtocolVersion::V5.is_v5());
        assert!(!ProtocolVersion::V311.is_v5());
    }

    #[test]
    fn test_scheme_parsing() {
        assert_eq!(BrokerScheme::parse("tcp"), Some(BrokerScheme::Tcp));
        assert_eq!(BrokerScheme::parse("mqtt"), Some(BrokerScheme::Tcp));
        assert_eq!(BrokerScheme::parse("SSL"), Some(BrokerScheme::Tls));
        assert_eq!(BrokerScheme::parse("mqtts"), Some(BrokerScheme::Tls));
        assert_eq!(BrokerScheme::parse("ws"), Some(BrokerScheme::Ws));
        assert_eq!(BrokerScheme::parse("wss"), Some(BrokerScheme::Wss));
        assert_eq!(BrokerScheme::parse("gopher"), None);
        assert!(BrokerScheme::Wss.is_websocket());
        assert!(!BrokerScheme::Tls.is_websocket());
    }

    #[test]
    fn test_unsupported_scheme_rejected() {
        let result = BridgeConfig::from_lookup(lookup_from(&[("MQTT_PROTOCOL", "gopher")]));
        assert!(matches!(result, Err(ConfigError::UnsupportedScheme(_))));
    }

    #[test]
    fn test_invalid_app_port_rejected() {
        let result = BridgeConfig::from_lookup(lookup_from(&[("APP_PORT", "http")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "APP_PORT"
        ));
    }

    #[test]
    fn test_reconnect_settings() {
        let config = BridgeConfig::from_lookup(lookup_from(&[
            ("MQTT_RECONNECT_DELAY_SECS", "2"),
            ("MQTT_RECONNECT_MAX_ATTEMPTS", "12"),
        ]))
        .unwrap();
        assert_eq!(config.mqtt.reconnect.delay_secs, 2);
        assert_eq!(config.mqtt.reconnect.max_attempts, Some(12));

        let result =
            BridgeConfig::from_lookup(lookup_from(&[("MQTT_RECONNECT_MAX_ATTEMPTS", "0")]));
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_surface_publish_errors_flag() {
        for (raw, expected) in [("true", true), ("1", true), ("YES", true), ("false", false), ("nope", false)] {
            let config = BridgeConfig::from_lookup(lookup_from(&[(
                "HTTP_SURFACE_PUBLISH_ERRORS",
                raw,
            )]))
            .unwrap();
            assert_eq!(config.http.surface_publish_errors, expected, "Failed for {raw}");
        }
    }

    #[test]
    fn test_generated_client_id_fits_mqtt31_limit() {
        let id = generate_client_id();
        assert!(id.starts_with("mqtt-http-bridge-"));
        assert!(id.len() <= 23);
        assert_ne!(generate_client_id(), generate_client_id());
    }

    #[test]
    fn test_password_redacted_when_serialized() {
        let config = BridgeConfig::from_lookup(lookup_from(&[
            ("MQTT_USERNAME", "bridge"),
            ("MQTT_PASSWORD", "hunter2"),
        ]))
        .unwrap();

        let rendered = toml::to_string_pretty(&config).unwrap();
        assert!(rendered.contains("bridge"));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("***"));
    }

    #[test]
    fn test_load_env_file_missing_is_not_an_error() {
        let loaded = load_env_file(Path::new("/definitely/not/here/.env")).unwrap();
        assert!(!loaded);
    }
}
