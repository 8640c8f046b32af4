//! Process configuration
//!
//! Loaded from a TOML file, then overridden from `DRONESEC_*` environment
//! variables, then validated. Sensor thresholds and the operator liveness
//! timeout are required and have no defaults.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::defaults;
use crate::message::{DeviceIdentity, Role};
use crate::protocol::RetryPolicy;

const CONFIG_FILE: &str = "dronesec.toml";
const ENV_PREFIX: &str = "DRONESEC_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidOverride { key: String, value: String },

    #[error("missing [{0}] section")]
    MissingSection(&'static str),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub identity: IdentityConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub drone: Option<DroneConfig>,
    pub operator: Option<OperatorConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IdentityConfig {
    pub device_id: String,
    pub role: Role,
    /// Lowercase hex SHA-256 of the device certificate
    pub certificate_fingerprint: String,
}

impl IdentityConfig {
    pub fn to_identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(
            self.device_id.clone(),
            self.role,
            self.certificate_fingerprint.to_ascii_lowercase(),
        )
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u64,
    pub connect_timeout_ms: u64,
    /// Publishes buffered while disconnected
    pub outbound_buffer_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8883,
            keep_alive_secs: defaults::KEEP_ALIVE_SECS,
            connect_timeout_ms: defaults::CONNECT_TIMEOUT_MS,
            outbound_buffer_capacity: defaults::OUTBOUND_BUFFER_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    pub ca_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca_path: PathBuf::from("certs/ca.pem"),
            cert_path: PathBuf::from("certs/device.pem"),
            key_path: PathBuf::from("certs/device.key"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: defaults::RECONNECT_BASE_DELAY_MS,
            max_delay_ms: defaults::RECONNECT_MAX_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub ack_timeout_ms: u64,
    pub max_interval_ms: u64,
    pub max_attempts: u32,
    pub tick_ms: u64,
    pub ack_cache_capacity: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: defaults::COMMAND_ACK_TIMEOUT_MS,
            max_interval_ms: defaults::COMMAND_MAX_RETRY_INTERVAL_MS,
            max_attempts: defaults::COMMAND_MAX_ATTEMPTS,
            tick_ms: defaults::RETRY_TICK_MS,
            ack_cache_capacity: defaults::ACK_CACHE_CAPACITY,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            max_interval: Duration::from_millis(self.max_interval_ms),
            max_attempts: self.max_attempts,
        }
    }
}

/// How a reading is compared against its limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdDirection {
    /// value >= limit breaches
    Above,
    /// value <= limit breaches; non-positive readings mean "nothing detected"
    Below,
    /// |value| > limit breaches
    Magnitude,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct ThresholdConfig {
    pub direction: ThresholdDirection,
    pub soft: f64,
    pub hard: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DroneConfig {
    /// Thresholds by sensor name
    pub thresholds: BTreeMap<String, ThresholdConfig>,
    /// How long readings must stay within soft limits to leave WARNING
    pub recovery_window_ms: u64,
    #[serde(default = "default_telemetry_interval_ms")]
    pub telemetry_interval_ms: u64,
    #[serde(default = "default_execution_timeout_ms")]
    pub execution_timeout_ms: u64,
}

fn default_telemetry_interval_ms() -> u64 {
    1000
}

fn default_execution_timeout_ms() -> u64 {
    defaults::EXECUTION_TIMEOUT_MS
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OperatorConfig {
    /// The drone this console is paired with
    pub drone_id: String,
    pub liveness_timeout_ms: u64,
}

impl Config {
    /// Load from `path`, `DRONESEC_CONFIG_PATH` or `./dronesec.toml`
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(config_path);
        let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let mut config = Self::from_toml(&raw)?;
        config.apply_env_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `DRONESEC_*` overrides using `lookup` to read variables
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(val) = var("DEVICE_ID") {
            self.identity.device_id = val;
        }
        if let Some(val) = var("CERT_FINGERPRINT") {
            self.identity.certificate_fingerprint = val;
        }
        if let Some(val) = var("BROKER_HOST") {
            self.broker.host = val;
        }
        if let Some(val) = var("BROKER_PORT") {
            self.broker.port = parse_override("BROKER_PORT", &val)?;
        }
        if let Some(val) = var("TLS_CA_PATH") {
            self.tls.ca_path = PathBuf::from(val);
        }
        if let Some(val) = var("TLS_CERT_PATH") {
            self.tls.cert_path = PathBuf::from(val);
        }
        if let Some(val) = var("TLS_KEY_PATH") {
            self.tls.key_path = PathBuf::from(val);
        }
        if let Some(operator) = self.operator.as_mut() {
            if let Some(val) = var("OPERATOR_DRONE_ID") {
                operator.drone_id = val;
            }
            if let Some(val) = var("LIVENESS_TIMEOUT_MS") {
                operator.liveness_timeout_ms = parse_override("LIVENESS_TIMEOUT_MS", &val)?;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.device_id.trim().is_empty() {
            return Err(ConfigError::Invalid("identity.device_id must not be empty".into()));
        }
        if self.identity.device_id.contains(['/', '+', '#']) {
            return Err(ConfigError::Invalid(
                "identity.device_id must not contain topic separators or wildcards".into(),
            ));
        }
        let fingerprint = &self.identity.certificate_fingerprint;
        if fingerprint.len() != 64 || !fingerprint.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ConfigError::Invalid(
                "identity.certificate_fingerprint must be a hex SHA-256 digest".into(),
            ));
        }
        if self.broker.host.is_empty() || self.broker.port == 0 {
            return Err(ConfigError::Invalid("broker host and port are required".into()));
        }
        if self.broker.outbound_buffer_capacity == 0 {
            return Err(ConfigError::Invalid(
                "broker.outbound_buffer_capacity must be greater than zero".into(),
            ));
        }
        if self.reconnect.base_delay_ms == 0 || self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect delays must satisfy 0 < base_delay_ms <= max_delay_ms".into(),
            ));
        }
        if self.retry.max_attempts == 0 || self.retry.ack_timeout_ms == 0 || self.retry.tick_ms == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts, ack_timeout_ms and tick_ms must be greater than zero".into(),
            ));
        }
        if self.retry.ack_cache_capacity == 0 {
            return Err(ConfigError::Invalid(
                "retry.ack_cache_capacity must be greater than zero".into(),
            ));
        }

        match self.identity.role {
            Role::Drone => self.drone()?.validate(),
            Role::Operator => self.operator()?.validate(),
        }
    }

    pub fn drone(&self) -> Result<&DroneConfig, ConfigError> {
        self.drone.as_ref().ok_or(ConfigError::MissingSection("drone"))
    }

    pub fn operator(&self) -> Result<&OperatorConfig, ConfigError> {
        self.operator.as_ref().ok_or(ConfigError::MissingSection("operator"))
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect.base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect.max_delay_ms)
    }
}

impl DroneConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.thresholds.is_empty() {
            return Err(ConfigError::Invalid("drone.thresholds must not be empty".into()));
        }
        for (sensor, threshold) in &self.thresholds {
            let ordered = match threshold.direction {
                ThresholdDirection::Above => threshold.soft <= threshold.hard,
                ThresholdDirection::Below => {
                    threshold.hard > 0.0 && threshold.hard <= threshold.soft
                }
                ThresholdDirection::Magnitude => {
                    threshold.soft > 0.0 && threshold.soft <= threshold.hard
                }
            };
            if !threshold.soft.is_finite() || !threshold.hard.is_finite() || !ordered {
                return Err(ConfigError::Invalid(format!(
                    "threshold for {sensor}: soft {} / hard {} inconsistent with {:?}",
                    threshold.soft, threshold.hard, threshold.direction
                )));
            }
        }
        if self.recovery_window_ms == 0 {
            return Err(ConfigError::Invalid("drone.recovery_window_ms must be greater than zero".into()));
        }
        if self.telemetry_interval_ms == 0 || self.execution_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "drone.telemetry_interval_ms and execution_timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

impl OperatorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.drone_id.trim().is_empty() {
            return Err(ConfigError::Invalid("operator.drone_id must not be empty".into()));
        }
        if self.liveness_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "operator.liveness_timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidOverride {
        key: format!("{ENV_PREFIX}{key}"),
        value: value.to_string(),
    })
}

fn config_path() -> PathBuf {
    env::var(format!("{ENV_PREFIX}CONFIG_PATH"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(CONFIG_FILE))
}
