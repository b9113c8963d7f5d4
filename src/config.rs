//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `hub.toml`.
//!     loads configuration from file or falls back to defaults, then applies
//!     environment overrides for the broker.
//!
//! structure:
//!     - BrokerConfig: where the uplinks come from (host, port, topic, username).
//!     - ReconnectConfig: backoff between feed reconnects, startup give-up point.
//!     - StorageConfig: optional sqlite history file and its retention.
//!     - ServerConfig: bind address of the json api.
//!     - LoggingConfig: default log level, per-reading log lines.
//!     - devices: optional per-device metadata (location).
//!
//! secrets:
//!     the broker access token is never read from the file. it only comes from
//!     the `HUB_MQTT_PASSWORD` environment variable.
//!
//! ==============================================================================

use anyhow::Context;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_HOST: &str = "HUB_MQTT_HOST";
pub const ENV_PORT: &str = "HUB_MQTT_PORT";
pub const ENV_USERNAME: &str = "HUB_MQTT_USERNAME";
pub const ENV_PASSWORD: &str = "HUB_MQTT_PASSWORD";

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct HubConfig {
    pub broker: BrokerConfig,
    pub reconnect: ReconnectConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub devices: BTreeMap<String, DeviceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// network server application id, e.g. "fired1@ttn"
    pub username: Option<String>,
    /// wildcard uplink topic; other message kinds on it are tolerated
    pub topic: String,
    pub client_id_prefix: String,
    pub keep_alive_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "eu1.cloud.thethings.network".to_string(),
            port: 1883,
            username: None,
            topic: "v3/+/devices/+/up".to_string(),
            client_id_prefix: "weather-hub".to_string(),
            keep_alive_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// consecutive failures before the first successful connect that end the process
    pub max_startup_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            max_startup_attempts: 8,
        }
    }
}

impl ReconnectConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.initial_delay_ms))
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// sqlite history file; no history is kept on disk when unset
    pub sqlite_path: Option<PathBuf>,
    /// drop durable rows older than this; unset keeps everything
    pub retention_days: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0:3000".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// log every decoded reading at info level
    pub show_sensor_data: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            show_sensor_data: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DeviceConfig {
    /// free-form, usually "lat,lon"
    pub location: Option<String>,
}

impl HubConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("failed to parse config")
    }

    /// Load with default fallback
    ///
    /// Returns the file that was used, `None` when falling back to defaults.
    /// A config file that exists but does not parse is an error, not a fallback.
    pub fn load_or_default() -> anyhow::Result<(Self, Option<PathBuf>)> {
        let paths = [
            PathBuf::from("config").join("hub.toml"),
            PathBuf::from("..").join("config").join("hub.toml"),
        ];

        for path in paths {
            if path.exists() {
                let config = Self::load(&path)?;
                return Ok((config, Some(path)));
            }
        }
        Ok((Self::default(), None))
    }

    /// Apply broker overrides from the environment.
    ///
    /// `lookup` is `std::env::var(..).ok()` in production and a map in tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(host) = lookup(ENV_HOST) {
            self.broker.host = host;
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.broker.port = port
                .parse()
                .with_context(|| format!("{ENV_PORT} is not a port number: {port:?}"))?;
        }
        if let Some(username) = lookup(ENV_USERNAME) {
            self.broker.username = Some(username);
        }
        Ok(())
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        tracing::info!("┌─────────────────────────────────────────┐");
        tracing::info!("│            HUB CONFIGURATION            │");
        tracing::info!("├─────────────────────────────────────────┤");
        tracing::info!("│ Broker: {}:{}", self.broker.host, self.broker.port);
        tracing::info!("│ Topic: {}", self.broker.topic);
        tracing::info!("│ Username: {}", self.broker.username.as_deref().unwrap_or("(none)"));
        match &self.storage.sqlite_path {
            Some(path) => tracing::info!("│ History: {}", path.display()),
            None => tracing::info!("│ History: memory only"),
        }
        tracing::info!("│ API: {}", if self.server.enabled { self.server.bind.as_str() } else { "disabled" });
        tracing::info!("│ Known devices: {}", self.devices.len());
        tracing::info!("└─────────────────────────────────────────┘");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = HubConfig::parse("").unwrap();
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.reconnect.max_startup_attempts, 8);
        assert!(config.storage.sqlite_path.is_none());
        assert!(config.server.enabled);
    }

    #[test]
    fn test_full_file() {
        let config = HubConfig::parse(
            r#"
            [broker]
            host = "localhost"
            port = 1884
            username = "fired1@ttn"
            topic = "v3/fired1@ttn/devices/+/up"

            [storage]
            sqlite_path = "sensor_data.db"
            retention_days = 90

            [logging]
            level = "debug"
            show_sensor_data = false

            [devices."eui-a8610a32303f7904"]
            location = "-33.86,151.20"
            "#,
        )
        .unwrap();

        assert_eq!(config.broker.host, "localhost");
        assert_eq!(config.broker.username.as_deref(), Some("fired1@ttn"));
        // unset keys inside a present table still default
        assert_eq!(config.broker.keep_alive_secs, 30);
        assert_eq!(config.storage.retention_days, Some(90));
        assert!(!config.logging.show_sensor_data);
        assert_eq!(config.devices["eui-a8610a32303f7904"].location.as_deref(), Some("-33.86,151.20"));
        assert!(!config.devices.contains_key("eui-other"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [(ENV_HOST, "broker.local"), (ENV_PORT, "8883"), (ENV_USERNAME, "app@ttn")].into();
        let mut config = HubConfig::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string())).unwrap();

        assert_eq!(config.broker.host, "broker.local");
        assert_eq!(config.broker.port, 8883);
        assert_eq!(config.broker.username.as_deref(), Some("app@ttn"));
    }

    #[test]
    fn test_bad_port_env_is_an_error() {
        let mut config = HubConfig::default();
        let result = config.apply_env(|key| (key == ENV_PORT).then(|| "not-a-port".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_max_delay_never_below_initial() {
        let reconnect = ReconnectConfig {
            initial_delay_ms: 1000,
            max_delay_ms: 10,
            max_startup_attempts: 1,
        };
        assert_eq!(reconnect.max_delay(), Duration::from_millis(1000));
    }

    #[test]
    fn test_unknown_field_type_rejected() {
        assert!(HubConfig::parse("[broker]\nport = \"high\"").is_err());
    }
}
