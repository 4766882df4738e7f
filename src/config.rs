use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::fs;
use std::time::Duration;
use tracing::{info, warn};

use crate::binding::AckPolicy;
use crate::cluster::ClusterAddress;
use crate::error::ConfigError;
use crate::transport::QueuePolicy;
use crate::utils::mask_secret;

/// Settings every session needs, in echo order
pub const REQUIRED_KEYS: [&str; 7] = [
    "uri",
    "host",
    "virtualHost",
    "username",
    "password",
    "clusterNames",
    "queueName",
];

/// Required keys whose value may legitimately be empty
const MAY_BE_EMPTY: [&str; 1] = ["clusterNames"];

const SECRET_KEYS: [&str; 1] = ["password"];

/// Main configuration structure that mirrors the config.yaml file
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub settings: ConfigSnapshot,
    #[serde(default)]
    pub harness: HarnessConfig,
    #[serde(default = "RetryConfig::default")]
    pub retry: RetryConfig,
    #[serde(default = "LoggingConfig::default")]
    pub logging: LoggingConfig,
}

/// Flat, ordered name → value settings read once at startup.
///
/// Lookups ignore ASCII case, so `QueueName` and `queueName` address the same entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Mapping")]
pub struct ConfigSnapshot {
    entries: Vec<(String, String)>,
}

/// Validated view of a [`ConfigSnapshot`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub uri: String,
    pub host: String,
    pub virtual_host: String,
    pub username: String,
    pub password: String,
    pub cluster: ClusterAddress,
    pub queue_name: String,
}

/// Producer operating mode
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Read operator lines from stdin until "q"
    #[default]
    Interactive,
    /// Send a fixed number of numbered test messages
    Burst,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HarnessConfig {
    pub mode: Mode,
    pub burst_count: u32,
    pub burst_delay_ms: u64,
    pub interactive_delay_ms: u64,
    pub resolve_timeout_ms: u64,
    pub prefetch: u16,
    pub ack_policy: AckPolicy,
    pub queue_policy: QueuePolicy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    /// Maximum number of connection sweeps over the cluster nodes. -1 means infinite retries.
    pub max_attempts: i32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub output: String,
}

impl RetryConfig {
    /// Calculate the delay for the given retry attempt using exponential backoff
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay_ms =
            (self.initial_delay_ms as f64) * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay_ms = delay_ms.min(self.max_delay_ms as f64) as u64;

        Duration::from_millis(capped_delay_ms)
    }

    /// Check if we should retry based on the current attempt number
    pub fn should_retry(&self, attempt: u32) -> bool {
        if self.max_attempts < 0 {
            true // Infinite retries when negative
        } else {
            attempt < (self.max_attempts as u32)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1, // One sweep over the nodes, no retry
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: "stdout".to_string(),
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Interactive,
            burst_count: 1000,
            burst_delay_ms: 200,
            interactive_delay_ms: 500,
            resolve_timeout_ms: 10_000,
            prefetch: 16,
            ack_policy: AckPolicy::Always,
            queue_policy: QueuePolicy::Quorum,
        }
    }
}

impl HarnessConfig {
    pub fn burst_delay(&self) -> Duration {
        Duration::from_millis(self.burst_delay_ms)
    }

    pub fn interactive_delay(&self) -> Duration {
        Duration::from_millis(self.interactive_delay_ms)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;

        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }
}

impl ConfigSnapshot {
    /// Build a snapshot from name/value pairs. A repeated name replaces the earlier value.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut snapshot = Self::default();
        for (key, value) in pairs {
            snapshot.insert(key.into(), value.into());
        }
        snapshot
    }

    fn insert(&mut self, key: String, value: String) {
        match self
            .entries
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&key))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write every setting to the log, secrets masked
    pub fn echo(&self) {
        if self.is_empty() {
            warn!("⚠️ Settings are empty");
            return;
        }

        for (key, value) in self.iter() {
            if SECRET_KEYS.iter().any(|secret| secret.eq_ignore_ascii_case(key)) {
                info!("Key: {} Value: {}", key, mask_secret(value));
            } else {
                info!("Key: {} Value: {}", key, value);
            }
        }
    }

    fn require(&self, key: &str) -> Result<String, ConfigError> {
        let value = self
            .get(key)
            .ok_or_else(|| ConfigError::Missing(key.to_string()))?;

        let value = value.trim();
        if value.is_empty() && !MAY_BE_EMPTY.contains(&key) {
            return Err(ConfigError::Empty(key.to_string()));
        }

        Ok(value.to_string())
    }

    /// Check every required key and produce typed session settings
    pub fn validate(&self) -> Result<SessionSettings, ConfigError> {
        for key in REQUIRED_KEYS {
            self.require(key)?;
        }

        Ok(SessionSettings {
            uri: self.require("uri")?,
            host: self.require("host")?,
            virtual_host: self.require("virtualHost")?,
            username: self.require("username")?,
            password: self.require("password")?,
            cluster: ClusterAddress::parse(&self.require("clusterNames")?),
            queue_name: self.require("queueName")?,
        })
    }
}

impl TryFrom<Mapping> for ConfigSnapshot {
    type Error = ConfigError;

    fn try_from(mapping: Mapping) -> Result<Self, Self::Error> {
        let mut snapshot = Self::default();

        for (key, value) in mapping {
            let key = match key {
                Value::String(key) => key,
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "setting names must be strings, got {:?}",
                        other
                    )))
                }
            };

            let value = match value {
                Value::String(value) => value,
                Value::Number(number) => number.to_string(),
                Value::Bool(flag) => flag.to_string(),
                Value::Null => String::new(),
                _ => {
                    return Err(ConfigError::Invalid(format!(
                        "setting '{}' must be a scalar value",
                        key
                    )))
                }
            };

            snapshot.insert(key, value);
        }

        Ok(snapshot)
    }
}

impl SessionSettings {
    /// `uri + host + "/" + virtualHost + "/"`, e.g. `amqp://broker1/vh/`
    pub fn bus_address(&self) -> String {
        format!("{}{}/{}/", self.uri, self.host, self.virtual_host)
    }

    /// Address of the configured receive queue on this bus
    pub fn queue_address(&self) -> String {
        format!("{}{}", self.bus_address(), self.queue_name)
    }
}
