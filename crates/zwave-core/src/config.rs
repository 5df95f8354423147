//! Driver configuration: TOML file plus named `name=value` overrides.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{NodeCache, NullCache, TomlFileCache};
use crate::dispatcher::{ExponentialBackoff, RetryPolicy};
use crate::notification::LogLevel;
use crate::transport::serial::DEFAULT_BAUD_RATE;
use crate::transport::{
    ControllerInterface, ControllerTransport, SerialTransport, TransportError, UsbTransport,
};

/// Type of a named option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionType {
    Invalid,
    Bool,
    Int,
    String,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Unknown option: {0}")]
    UnknownOption(String),

    #[error("Option {name} expects {expected:?}, got {value:?}")]
    BadValue {
        name: String,
        expected: OptionType,
        value: String,
    },
}

/// Configuration for one driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Serial device path, or `VID:PID` for a raw USB controller.
    pub port: String,
    pub interface: ControllerInterface,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub reply_timeout_ms: u64,
    /// Transmissions per transaction, first one included.
    pub max_attempts: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    /// Failed query cycles before a node is declared dead.
    pub dead_node_threshold: u32,
    pub reconnect_attempts: u32,
    pub reconnect_backoff_ms: u64,
    pub poll_interval_ms: u64,
    /// Partial frames older than this are discarded.
    pub frame_timeout_ms: u64,
    /// Directory holding the network cache files.
    pub cache_path: Option<String>,
    /// Write the cache back on shutdown.
    pub save_configuration: bool,
    pub log_level: LogLevel,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            interface: ControllerInterface::Unknown,
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: 50,
            ack_timeout_ms: 1000,
            reply_timeout_ms: 5000,
            max_attempts: 3,
            retry_initial_backoff_ms: 100,
            retry_max_backoff_ms: 2000,
            dead_node_threshold: 2,
            reconnect_attempts: 3,
            reconnect_backoff_ms: 500,
            poll_interval_ms: 30_000,
            frame_timeout_ms: 1500,
            cache_path: None,
            save_configuration: true,
            log_level: LogLevel::Info,
        }
    }
}

impl DriverConfig {
    pub fn new(port: &str) -> Self {
        Self {
            port: port.to_string(),
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DriverConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            reply_timeout: Duration::from_millis(self.reply_timeout_ms),
            backoff: ExponentialBackoff::new(
                Duration::from_millis(self.retry_initial_backoff_ms),
                Duration::from_millis(self.retry_max_backoff_ms),
            ),
        }
    }

    pub fn reconnect_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.reconnect_backoff_ms),
            Duration::from_millis(self.reconnect_backoff_ms.saturating_mul(8)),
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    /// Cache backend named by `cache_path`.
    pub fn node_cache(&self) -> Box<dyn NodeCache> {
        match &self.cache_path {
            Some(dir) => Box::new(TomlFileCache::new(PathBuf::from(dir))),
            None => Box::new(NullCache),
        }
    }

    /// Interface to use when none is configured: `VID:PID` means raw USB.
    pub fn resolved_interface(&self) -> ControllerInterface {
        match self.interface {
            ControllerInterface::Unknown if UsbTransport::parse_ids(&self.port).is_some() => {
                ControllerInterface::Hid
            }
            ControllerInterface::Unknown => ControllerInterface::Serial,
            other => other,
        }
    }

    /// Open the configured controller.
    pub fn open_transport(&self) -> Result<Box<dyn ControllerTransport>, TransportError> {
        match self.resolved_interface() {
            ControllerInterface::Hid => {
                let (vid, pid) = UsbTransport::parse_ids(&self.port)
                    .ok_or_else(|| TransportError::DeviceNotFound(self.port.clone()))?;
                Ok(Box::new(UsbTransport::open_with_ids(vid, pid)?))
            }
            _ => Ok(Box::new(SerialTransport::open(
                &self.port,
                self.baud_rate,
                Duration::from_millis(self.read_timeout_ms),
            )?)),
        }
    }

    /// Type of the option called `name`.
    pub fn option_type(name: &str) -> OptionType {
        match name {
            "save_configuration" => OptionType::Bool,
            "baud_rate" | "read_timeout_ms" | "ack_timeout_ms" | "reply_timeout_ms"
            | "max_attempts" | "retry_initial_backoff_ms" | "retry_max_backoff_ms"
            | "dead_node_threshold" | "reconnect_attempts" | "reconnect_backoff_ms"
            | "poll_interval_ms" | "frame_timeout_ms" => OptionType::Int,
            "port" | "interface" | "cache_path" | "log_level" => OptionType::String,
            _ => OptionType::Invalid,
        }
    }

    /// Apply a `name=value` override.
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        let expected = Self::option_type(name);
        let bad = || ConfigError::BadValue {
            name: name.to_string(),
            expected,
            value: value.to_string(),
        };
        let int = || value.trim().parse::<u64>().map_err(|_| bad());
        let small = || int().and_then(|v| u32::try_from(v).map_err(|_| bad()));

        match name {
            "port" => self.port = value.to_string(),
            "interface" => {
                self.interface = match value.to_ascii_lowercase().as_str() {
                    "serial" => ControllerInterface::Serial,
                    "hid" | "usb" => ControllerInterface::Hid,
                    "unknown" | "auto" => ControllerInterface::Unknown,
                    _ => return Err(bad()),
                }
            }
            "cache_path" => {
                self.cache_path = (!value.is_empty()).then(|| value.to_string());
            }
            "log_level" => self.log_level = LogLevel::from_name(value).ok_or_else(bad)?,
            "save_configuration" => {
                self.save_configuration = match value.to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" => true,
                    "false" | "0" | "no" => false,
                    _ => return Err(bad()),
                }
            }
            "baud_rate" => self.baud_rate = small()?,
            "read_timeout_ms" => self.read_timeout_ms = int()?,
            "ack_timeout_ms" => self.ack_timeout_ms = int()?,
            "reply_timeout_ms" => self.reply_timeout_ms = int()?,
            "max_attempts" => self.max_attempts = small()?,
            "retry_initial_backoff_ms" => self.retry_initial_backoff_ms = int()?,
            "retry_max_backoff_ms" => self.retry_max_backoff_ms = int()?,
            "dead_node_threshold" => self.dead_node_threshold = small()?,
            "reconnect_attempts" => self.reconnect_attempts = small()?,
            "reconnect_backoff_ms" => self.reconnect_backoff_ms = int()?,
            "poll_interval_ms" => self.poll_interval_ms = int()?,
            "frame_timeout_ms" => self.frame_timeout_ms = int()?,
            _ => return Err(ConfigError::UnknownOption(name.to_string())),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_option_types() {
        let mut config = DriverConfig::default();
        config.set_option("max_attempts", "5").unwrap();
        config.set_option("log_level", "debug").unwrap();
        config.set_option("save_configuration", "no").unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert!(!config.save_configuration);

        assert_eq!(
            config.set_option("max_attempts", "many"),
            Err(ConfigError::BadValue {
                name: "max_attempts".into(),
                expected: OptionType::Int,
                value: "many".into(),
            })
        );
        assert_eq!(config.max_attempts, 5);
        assert!(matches!(
            config.set_option("colour", "blue"),
            Err(ConfigError::UnknownOption(_))
        ));
        assert_eq!(DriverConfig::option_type("colour"), OptionType::Invalid);
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = DriverConfig::new("/dev/ttyACM0");
        config.cache_path = Some("/var/lib/zwave".into());
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: DriverConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);

        let partial: DriverConfig = toml::from_str("port = \"COM3\"\nmax_attempts = 4\n").unwrap();
        assert_eq!(partial.port, "COM3");
        assert_eq!(partial.max_attempts, 4);
        assert_eq!(partial.ack_timeout_ms, 1000);
    }

    #[test]
    fn test_interface_guess() {
        assert_eq!(
            DriverConfig::new("0658:0200").resolved_interface(),
            ControllerInterface::Hid
        );
        assert_eq!(
            DriverConfig::new("/dev/ttyUSB0").resolved_interface(),
            ControllerInterface::Serial
        );
    }

    #[test]
    fn test_retry_policy_from_config() {
        let config = DriverConfig {
            max_attempts: 0,
            ..Default::default()
        };
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.ack_timeout, Duration::from_millis(1000));
    }
}
