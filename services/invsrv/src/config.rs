//! Service configuration
//!
//! Layered with figment, lowest to highest priority:
//! 1. built-in defaults
//! 2. optional YAML file (`--config`)
//! 3. legacy environment names (`DEYE_LOGGER_IP`, `MQTT_HOST`, ...)
//! 4. `INVSRV_<SECTION>__<KEY>` environment variables

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    value::{Uncased, UncasedStr},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::collector::CollectorTiming;
use crate::error::{InvSrvError, Result};
use crate::exporter::DEFAULT_METRIC_PREFIX;
use crate::publisher::{MqttSettings, PublisherTiming, DEFAULT_TOPIC};
use crate::session::RetryPolicy;
use crate::transport::{Endpoint, MODBUS_MAX_READ_REGISTERS};

/// Environment names used by existing deployments, mapped to config keys
const LEGACY_ENV: &[(&str, &str)] = &[
    ("DEYE_LOGGER_IP", "device.address"),
    ("DEYE_LOGGER_PORT", "device.port"),
    ("DEYE_LOGGER_SERIAL", "device.serial"),
    ("MQTT_HOST", "mqtt.host"),
    ("MQTT_PORT", "mqtt.port"),
    ("MQTT_USERNAME", "mqtt.username"),
    ("MQTT_PASSWORD", "mqtt.password"),
    ("MQTT_TOPIC", "mqtt.topic"),
    ("HTTP_HOST", "exporter.host"),
    ("HTTP_PORT", "exporter.port"),
];

const ENV_PREFIX: &str = "INVSRV_";

/// Data logger connection and read policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Logger host name or IP address
    pub address: String,
    pub port: u16,
    /// Logger serial number
    pub serial: u32,
    pub slave_id: u8,
    /// Registers per bulk read
    pub max_span: u16,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    /// Attempts per collection cycle, the first one included
    pub max_attempts: u32,
    pub retry_backoff_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: 8899,
            serial: 0,
            slave_id: 1,
            max_span: MODBUS_MAX_READ_REGISTERS,
            connect_timeout_secs: 10,
            read_timeout_secs: 10,
            max_attempts: 10,
            retry_backoff_secs: 60,
        }
    }
}

impl DeviceConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            address: self.address.clone(),
            port: self.port,
            serial: self.serial,
            slave_id: self.slave_id,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: Duration::from_secs(self.retry_backoff_secs),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub period_secs: u64,
    pub error_backoff_secs: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            period_secs: 20,
            error_backoff_secs: 60,
        }
    }
}

impl CollectorConfig {
    pub fn timing(&self) -> CollectorTiming {
        CollectorTiming {
            period: Duration::from_secs(self.period_secs),
            error_backoff: Duration::from_secs(self.error_backoff_secs),
        }
    }
}

/// Prometheus endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    pub host: String,
    pub port: u16,
    /// Snapshots older than this are not exposed
    pub freshness_secs: u64,
    pub metric_prefix: String,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8181,
            freshness_secs: 600,
            metric_prefix: DEFAULT_METRIC_PREFIX.to_string(),
        }
    }
}

impl ExporterConfig {
    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_secs)
    }

    /// Resolve `host:port` to the address to bind
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| {
                InvSrvError::config(format!(
                    "exporter address {}:{}: {}",
                    self.host, self.port, e
                ))
            })?
            .next()
            .ok_or_else(|| {
                InvSrvError::config(format!(
                    "exporter address {}:{} resolves to nothing",
                    self.host, self.port
                ))
            })
    }
}

/// Message bus; publishing is enabled when `host` is set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic: String,
    pub client_id: String,
    pub empty_sleep_secs: u64,
    pub send_interval_secs: u64,
    pub ack_timeout_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 1883,
            username: None,
            password: None,
            topic: DEFAULT_TOPIC.to_string(),
            client_id: "invsrv".to_string(),
            empty_sleep_secs: 10,
            send_interval_secs: 30,
            ack_timeout_secs: 30,
        }
    }
}

impl MqttConfig {
    pub fn enabled(&self) -> bool {
        self.host.is_some()
    }

    /// Broker settings, `None` when publishing is disabled
    pub fn settings(&self) -> Option<MqttSettings> {
        let host = self.host.clone()?;
        Some(MqttSettings {
            host,
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            client_id: self.client_id.clone(),
            ack_timeout: Duration::from_secs(self.ack_timeout_secs),
        })
    }

    pub fn timing(&self) -> PublisherTiming {
        PublisherTiming {
            empty_sleep: Duration::from_secs(self.empty_sleep_secs),
            send_interval: Duration::from_secs(self.send_interval_secs),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for daily log files; `--log-dir` takes precedence
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub collector: CollectorConfig,
    pub exporter: ExporterConfig,
    pub mqtt: MqttConfig,
    pub logging: LoggingConfig,
    /// YAML register map replacing the built-in Deye catalog
    pub register_map: Option<PathBuf>,
}

/// Prometheus metric name: `[a-zA-Z_:][a-zA-Z0-9_:]*`
fn is_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' || first == ':' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
        },
        _ => false,
    }
}

fn legacy_key(key: &UncasedStr) -> Uncased<'_> {
    match LEGACY_ENV.iter().find(|(name, _)| key == *name) {
        Some((_, path)) => Uncased::from_borrowed(*path),
        None => Uncased::from_borrowed(key.as_str()),
    }
}

impl AppConfig {
    /// Provider chain without extraction, exposed for inspection in tests
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }

        let legacy_names: Vec<&str> = LEGACY_ENV.iter().map(|(name, _)| *name).collect();
        figment
            .merge(Env::raw().only(&legacy_names).map(legacy_key))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate; a named file must exist
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            if !path.exists() {
                return Err(InvSrvError::config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
        }

        let config: AppConfig = Self::figment(path)
            .extract()
            .map_err(|e| InvSrvError::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let d = &self.device;
        if d.address.trim().is_empty() {
            return Err(InvSrvError::config(
                "device.address is required (DEYE_LOGGER_IP)",
            ));
        }
        if d.serial == 0 {
            return Err(InvSrvError::config(
                "device.serial is required (DEYE_LOGGER_SERIAL)",
            ));
        }
        if d.max_span == 0 || d.max_span > MODBUS_MAX_READ_REGISTERS {
            return Err(InvSrvError::config(format!(
                "device.max_span must be within 1..={}, got {}",
                MODBUS_MAX_READ_REGISTERS, d.max_span
            )));
        }
        if d.max_attempts == 0 {
            return Err(InvSrvError::config("device.max_attempts must be at least 1"));
        }
        if self.collector.period_secs == 0 {
            return Err(InvSrvError::config("collector.period_secs must be positive"));
        }
        if !is_metric_name(&self.exporter.metric_prefix) {
            return Err(InvSrvError::config(format!(
                "exporter.metric_prefix must match [a-zA-Z_:][a-zA-Z0-9_:]*, got '{}'",
                self.exporter.metric_prefix
            )));
        }
        if self.mqtt.enabled() && self.mqtt.topic.is_empty() {
            return Err(InvSrvError::config("mqtt.topic must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn valid() -> AppConfig {
        let mut config = AppConfig::default();
        config.device.address = "192.168.1.50".to_string();
        config.device.serial = 2_712_345_678;
        config
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.device.port, 8899);
        assert_eq!(config.device.max_span, 125);
        assert_eq!(config.device.max_attempts, 10);
        assert_eq!(config.collector.timing(), CollectorTiming::default());
        assert_eq!(config.exporter.port, 8181);
        assert_eq!(config.exporter.freshness(), Duration::from_secs(600));
        assert_eq!(config.mqtt.topic, "homeassistant/sensor/inverter/state");
        assert_eq!(config.mqtt.timing(), PublisherTiming::default());
        assert!(!config.mqtt.enabled());
        assert!(config.mqtt.settings().is_none());
    }

    #[test]
    fn test_validate() {
        assert!(valid().validate().is_ok());
        // Defaults alone lack the device
        assert!(AppConfig::default().validate().is_err());

        let mut config = valid();
        config.device.serial = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.device.max_span = 126;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.device.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.collector.period_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_metric_prefix_must_be_a_metric_name() {
        for prefix in ["deye_inverter_metrics", "_solar", "site:inverter_1"] {
            let mut config = valid();
            config.exporter.metric_prefix = prefix.to_string();
            assert!(config.validate().is_ok(), "{}", prefix);
        }
        for prefix in ["", "deye-inverter", "1st_inverter", "inverter metrics", "wärme"] {
            let mut config = valid();
            config.exporter.metric_prefix = prefix.to_string();
            assert!(
                matches!(config.validate(), Err(InvSrvError::ConfigError(_))),
                "{}",
                prefix
            );
        }
    }

    #[test]
    fn test_exporter_socket_addr() {
        let addr = valid().exporter.socket_addr().unwrap();
        assert_eq!(addr, "127.0.0.1:8181".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = AppConfig::load(Some(Path::new("/nonexistent/invsrv.yaml"))).unwrap_err();
        assert!(matches!(err, InvSrvError::ConfigError(_)));
    }

    #[test]
    fn test_yaml_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "invsrv.yaml",
                r#"
device:
  address: 10.0.0.7
  serial: 1234567890
  max_attempts: 3
collector:
  period_secs: 15
mqtt:
  host: broker.local
"#,
            )?;

            let config =
                AppConfig::load(Some(Path::new("invsrv.yaml"))).map_err(|e| e.to_string())?;
            assert_eq!(config.device.address, "10.0.0.7");
            assert_eq!(config.device.serial, 1_234_567_890);
            assert_eq!(config.device.retry_policy().max_attempts, 3);
            assert_eq!(config.device.port, 8899);
            assert_eq!(config.collector.period_secs, 15);
            assert_eq!(config.collector.error_backoff_secs, 60);

            let mqtt = config.mqtt.settings().ok_or("mqtt should be enabled")?;
            assert_eq!(mqtt.host, "broker.local");
            assert_eq!(mqtt.port, 1883);
            Ok(())
        });
    }

    #[test]
    fn test_legacy_environment() {
        Jail::expect_with(|jail| {
            jail.set_env("DEYE_LOGGER_IP", "192.168.1.50");
            jail.set_env("DEYE_LOGGER_SERIAL", "2712345678");
            jail.set_env("MQTT_HOST", "broker.local");
            jail.set_env("MQTT_TOPIC", "home/inverter");
            jail.set_env("HTTP_PORT", "9100");

            let config = AppConfig::load(None).map_err(|e| e.to_string())?;
            assert_eq!(config.device.address, "192.168.1.50");
            assert_eq!(config.device.serial, 2_712_345_678);
            assert_eq!(config.mqtt.host.as_deref(), Some("broker.local"));
            assert_eq!(config.mqtt.topic, "home/inverter");
            assert_eq!(config.exporter.port, 9100);
            Ok(())
        });
    }

    #[test]
    fn test_prefixed_environment_wins() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "invsrv.yaml",
                "device:\n  address: 10.0.0.7\n  serial: 42\n",
            )?;
            jail.set_env("DEYE_LOGGER_IP", "192.168.1.50");
            jail.set_env("INVSRV_DEVICE__ADDRESS", "172.16.0.9");
            jail.set_env("INVSRV_COLLECTOR__PERIOD_SECS", "5");

            let config =
                AppConfig::load(Some(Path::new("invsrv.yaml"))).map_err(|e| e.to_string())?;
            assert_eq!(config.device.address, "172.16.0.9");
            assert_eq!(config.device.serial, 42);
            assert_eq!(config.collector.period_secs, 5);
            Ok(())
        });
    }
}
