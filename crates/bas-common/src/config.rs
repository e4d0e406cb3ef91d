//! Configuration structures for the I/O controller.
//!
//! Supports TOML deserialization with sensible defaults for
//! development and explicit values for production deployment.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BasConfig {
    /// Period of the control cycle (plugin update pass + flush).
    #[serde(with = "humantime_serde")]
    pub cycle_time: Duration,

    /// On-board REST I/O module.
    pub local: LocalConfig,

    /// Modbus interfaces, one entry per physical bus or port.
    pub interfaces: Vec<InterfaceConfig>,

    /// Native-range metadata for analog points, keyed by symbolic address.
    pub analog: BTreeMap<String, AnalogRange>,

    /// Points polled by the built-in monitor.
    pub monitor: MonitorConfig,

    /// Cycle metrics configuration.
    pub metrics: MetricsConfig,
}

impl Default for BasConfig {
    fn default() -> Self {
        Self {
            cycle_time: Duration::from_secs(1),
            local: LocalConfig::default(),
            interfaces: Vec::new(),
            analog: BTreeMap::new(),
            monitor: MonitorConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// On-board REST I/O module configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Base URL of the REST service, without the `/rest` suffix.
    pub base_url: String,

    /// Per-request timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Local symbolic name (e.g. `DI3`) to REST circuit id (e.g. `1_03`).
    pub pins: BTreeMap<String, String>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            base_url: String::from("http://127.0.0.1:8080"),
            timeout: Duration::from_secs(5),
            pins: BTreeMap::new(),
        }
    }
}

/// Physical transport used by a Modbus interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Modbus TCP with MBAP framing.
    #[default]
    Tcp,
    /// Modbus RTU over a serial line.
    Rtu,
    /// RTU frames carried over a TCP stream (serial gateways).
    RtuOverTcp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Rtu => write!(f, "rtu"),
            Self::RtuOverTcp => write!(f, "rtu_over_tcp"),
        }
    }
}

/// Serial parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Even parity.
    Even,
    /// Odd parity.
    Odd,
}

/// Configuration of one Modbus interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceConfig {
    /// Interface index used in remote addresses (`U<id>`).
    pub id: u8,

    /// Framing and medium.
    pub kind: TransportKind,

    /// `host:port` for TCP and RTU-over-TCP.
    pub address: Option<String>,

    /// Serial device path for RTU.
    pub port: Option<String>,

    /// Serial baud rate.
    pub baud_rate: u32,

    /// Serial parity.
    pub parity: Parity,

    /// Serial stop bits (1 or 2).
    pub stop_bits: u8,

    /// Serial data bits (5 to 8).
    pub data_bits: u8,

    /// Per-transaction timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Offset added to an endpoint's device id to form the wire unit id.
    pub unit_base: u8,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            id: 0,
            kind: TransportKind::Tcp,
            address: None,
            port: None,
            baud_rate: 9600,
            parity: Parity::None,
            stop_bits: 1,
            data_bits: 8,
            timeout: Duration::from_secs(1),
            unit_base: 0,
        }
    }
}

impl InterfaceConfig {
    /// Human-readable location of the interface for logs.
    #[must_use]
    pub fn location(&self) -> String {
        match self.kind {
            TransportKind::Rtu => self.port.clone().unwrap_or_default(),
            TransportKind::Tcp | TransportKind::RtuOverTcp => {
                self.address.clone().unwrap_or_default()
            }
        }
    }
}

/// Linear mapping between a device-native range and an engineering window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalogRange {
    /// Native value mapped to `min`.
    pub native_min: f64,
    /// Native value mapped to `max`.
    pub native_max: f64,
    /// Lower end of the engineering window.
    pub min: f64,
    /// Upper end of the engineering window.
    pub max: f64,
}

impl Default for AnalogRange {
    fn default() -> Self {
        Self {
            native_min: 0.0,
            native_max: 10.0,
            min: 0.0,
            max: 10.0,
        }
    }
}

/// Built-in monitor plugin configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Symbolic names read every cycle.
    pub points: Vec<String>,
}

/// Cycle metrics configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Number of cycle-time samples kept for percentiles.
    pub histogram_size: usize,

    /// Cycles between periodic status log lines (0 disables).
    pub log_interval: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            histogram_size: 1_000,
            log_interval: 600,
        }
    }
}

impl BasConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Structural checks that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for iface in &self.interfaces {
            if !seen.insert(iface.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate interface id {}",
                    iface.id
                )));
            }
            match iface.kind {
                TransportKind::Rtu if iface.port.is_none() => {
                    return Err(ConfigError::Invalid(format!(
                        "rtu interface {} has no serial port",
                        iface.id
                    )));
                }
                TransportKind::Tcp | TransportKind::RtuOverTcp if iface.address.is_none() => {
                    return Err(ConfigError::Invalid(format!(
                        "{} interface {} has no address",
                        iface.kind, iface.id
                    )));
                }
                _ => {}
            }
            if !matches!(iface.stop_bits, 1 | 2) || !(5..=8).contains(&iface.data_bits) {
                return Err(ConfigError::Invalid(format!(
                    "interface {} has unsupported serial framing {}{}",
                    iface.id, iface.data_bits, iface.stop_bits
                )));
            }
        }

        for (name, range) in &self.analog {
            if (range.native_max - range.native_min).abs() < f64::EPSILON {
                return Err(ConfigError::Invalid(format!(
                    "analog range for {name} has an empty native span"
                )));
            }
        }

        if self.cycle_time.is_zero() {
            return Err(ConfigError::Invalid("cycle_time must be non-zero".into()));
        }

        Ok(())
    }

    /// Look up an interface by id.
    #[must_use]
    pub fn interface(&self, id: u8) -> Option<&InterfaceConfig> {
        self.interfaces.iter().find(|i| i.id == id)
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Semantically invalid configuration.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
