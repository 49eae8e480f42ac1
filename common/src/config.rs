use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topics::{normalize_root_topic, MQTT_ROOT_TOPIC};

pub const MQTT_HOST_MAX: usize = 63;
pub const MQTT_USER_MAX: usize = 31;
pub const MQTT_PASS_MAX: usize = 31;
pub const OTA_PASSWORD_MAX: usize = 31;

pub type BoundedText<const N: usize> = heapless::String<N>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },
    #[error("{field} exceeds {max} bytes")]
    TooLong { field: &'static str, max: usize },
    #[error("mqtt port must be between 1 and 65535")]
    InvalidPort,
}

/// How the delta baseline moves on ticks that do not publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BaselinePolicy {
    /// Every unpublished sample becomes the new baseline.
    #[default]
    Drift,
    /// The baseline stays at the last published value.
    Pinned,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReporterConfig {
    pub update_interval_ms: u64,
    pub delta_threshold: u32,
    pub warmup_ms: u64,
    pub max_reconnect_tries: u32,
    pub reconnect_backoff_ms: u64,
    pub baseline: BaselinePolicy,
    pub root_topic: String,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 2_000,
            delta_threshold: 5,
            warmup_ms: 10_000,
            max_reconnect_tries: 10,
            reconnect_backoff_ms: 5_000,
            baseline: BaselinePolicy::Drift,
            root_topic: MQTT_ROOT_TOPIC.to_string(),
        }
    }
}

impl ReporterConfig {
    pub fn sanitize(&mut self) {
        self.max_reconnect_tries = self.max_reconnect_tries.max(1);
        self.root_topic = normalize_root_topic(&self.root_topic);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// MQTT client id on both shells and the station hostname on the ESP.
    pub hostname: String,
    pub baud_rate: u32,
    /// Handed to the OTA collaborator; the reporter never reads it.
    pub ota_password: String,
    pub wifi_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            hostname: "smokesensor".to_string(),
            baud_rate: 115_200,
            ota_password: "admin".to_string(),
            wifi_timeout_ms: 30_000,
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hostname.trim().is_empty() {
            return Err(ConfigError::Empty { field: "hostname" });
        }
        bounded::<OTA_PASSWORD_MAX>("ota password", &self.ota_password)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

/// Broker credentials after length validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerCredentials {
    pub host: BoundedText<MQTT_HOST_MAX>,
    pub port: u16,
    pub user: BoundedText<MQTT_USER_MAX>,
    pub pass: BoundedText<MQTT_PASS_MAX>,
}

impl BrokerCredentials {
    pub fn from_network(network: &NetworkConfig) -> Result<Self, ConfigError> {
        let host = network.mqtt_host.trim();
        if host.is_empty() {
            return Err(ConfigError::Empty { field: "mqtt host" });
        }
        if network.mqtt_port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        Ok(Self {
            host: bounded("mqtt host", host)?,
            port: network.mqtt_port,
            user: bounded("mqtt user", network.mqtt_user.trim())?,
            pass: bounded("mqtt password", &network.mqtt_pass)?,
        })
    }

    pub fn has_login(&self) -> bool {
        !self.user.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub reporter: ReporterConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl RuntimeConfig {
    pub fn from_json(raw: &[u8]) -> Result<Self, serde_json::Error> {
        let mut runtime: RuntimeConfig = serde_json::from_slice(raw)?;
        runtime.reporter.sanitize();
        Ok(runtime)
    }
}

fn bounded<const N: usize>(
    field: &'static str,
    value: &str,
) -> Result<BoundedText<N>, ConfigError> {
    BoundedText::<N>::try_from(value).map_err(|_| ConfigError::TooLong { field, max: N })
}
