//! Configuration structures for the clock sync run.
//!
//! Built-in defaults describe the reference lab setup. A TOML file can
//! override any field; durations use humantime format (`"2s"`, `"200ms"`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::time::TIMESTAMP_REGISTER_COUNT;

/// Default Modbus TCP port.
pub const DEFAULT_MODBUS_PORT: u16 = 502;

/// Default unit identifier.
pub const DEFAULT_UNIT_ID: u8 = 1;

/// Top-level sync configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Connect and per-request I/O timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Pause between writing the clock and reading it back.
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,

    /// Address requests to each target's unit id instead of the default unit.
    pub apply_unit_id: bool,

    /// Register layout of the device clock.
    pub registers: RegisterMap,

    /// Devices to synchronize, in order.
    pub devices: Vec<DeviceTarget>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            settle_delay: Duration::from_millis(200),
            apply_unit_id: false,
            registers: RegisterMap::default(),
            devices: vec![
                DeviceTarget::new("192.168.7.2", DEFAULT_MODBUS_PORT, DEFAULT_UNIT_ID),
                DeviceTarget::new("192.168.7.200", DEFAULT_MODBUS_PORT, DEFAULT_UNIT_ID),
            ],
        }
    }
}

/// Register addresses of the device clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterMap {
    /// First input register of the timestamp snapshot (epoch hi, epoch lo, ms).
    pub read_address: u16,
    /// Number of input registers to read.
    pub read_count: u16,
    /// First holding register of the writable epoch pair.
    pub write_epoch_address: u16,
    /// Number of epoch holding registers.
    pub write_epoch_count: u16,
    /// Also write the millisecond register.
    pub write_ms_enabled: bool,
    /// Holding register carrying milliseconds.
    pub write_ms_address: u16,
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self {
            read_address: 3,
            read_count: 3,
            write_epoch_address: 290,
            write_epoch_count: 2,
            write_ms_enabled: false,
            write_ms_address: 292,
        }
    }
}

impl RegisterMap {
    /// Inclusive range of input registers read, e.g. `3..5`.
    #[must_use]
    pub fn read_range(&self) -> RegisterRange {
        RegisterRange::new(self.read_address, self.read_count)
    }

    /// Inclusive range of epoch holding registers written, e.g. `290..291`.
    #[must_use]
    pub fn write_range(&self) -> RegisterRange {
        RegisterRange::new(self.write_epoch_address, self.write_epoch_count)
    }
}

/// A span of registers, displayed as `first..last`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterRange {
    /// First register address.
    pub start: u16,
    /// Number of registers.
    pub count: u16,
}

impl RegisterRange {
    /// Create a new range.
    #[must_use]
    pub fn new(start: u16, count: u16) -> Self {
        Self { start, count }
    }
}

impl fmt::Display for RegisterRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last = self.start.saturating_add(self.count.saturating_sub(1));
        write!(f, "{}..{}", self.start, last)
    }
}

/// A device to synchronize.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceTarget {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Unit/station identifier.
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
}

fn default_port() -> u16 {
    DEFAULT_MODBUS_PORT
}

fn default_unit_id() -> u8 {
    DEFAULT_UNIT_ID
}

impl DeviceTarget {
    /// Create a new target.
    pub fn new(host: impl Into<String>, port: u16, unit_id: u8) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
        }
    }
}

impl fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{} unit={}", self.host, self.port, self.unit_id)
        } else {
            write!(f, "{}:{} unit={}", self.host, self.port, self.unit_id)
        }
    }
}

/// Parses `host`, `host:port`, `host/unit` or `host:port/unit`.
///
/// IPv6 literals are written bare (`fe80::1`, default port) or bracketed
/// (`[fe80::1]:1502`).
impl FromStr for DeviceTarget {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::Invalid(format!("device '{s}': {reason}"));

        let (endpoint, unit_id) = match s.rsplit_once('/') {
            Some((endpoint, unit)) => {
                let unit_id = unit.parse::<u8>().map_err(|_| invalid("bad unit id"))?;
                (endpoint, unit_id)
            }
            None => (s, DEFAULT_UNIT_ID),
        };

        let (host, port) = if let Some(bracketed) = endpoint.strip_prefix('[') {
            let (host, rest) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unclosed '['"))?;
            let port = match rest {
                "" => DEFAULT_MODBUS_PORT,
                _ => rest
                    .strip_prefix(':')
                    .and_then(|port| port.parse::<u16>().ok())
                    .ok_or_else(|| invalid("bad port"))?,
            };
            (host, port)
        } else if endpoint.matches(':').count() > 1 {
            // Bare IPv6 literal; a port needs the bracketed form.
            (endpoint, DEFAULT_MODBUS_PORT)
        } else {
            match endpoint.rsplit_once(':') {
                Some((host, port)) => {
                    let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
                    (host, port)
                }
                None => (endpoint, DEFAULT_MODBUS_PORT),
            }
        };

        if host.is_empty() {
            return Err(invalid("empty host"));
        }

        Ok(Self::new(host, port, unit_id))
    }
}

impl SyncConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        debug!(path = %path.display(), bytes = content.len(), "Read config file");
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        debug!(
            devices = config.devices.len(),
            timeout = ?config.timeout,
            write_ms = config.registers.write_ms_enabled,
            "Parsed sync config"
        );
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

    /// Check the register layout and timing values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid("timeout must be non-zero".into()));
        }
        if usize::from(self.registers.read_count) < TIMESTAMP_REGISTER_COUNT {
            return Err(ConfigError::Invalid(format!(
                "read_count must be at least {TIMESTAMP_REGISTER_COUNT}, got {}",
                self.registers.read_count
            )));
        }
        // Modbus caps a single read at 125 registers.
        if self.registers.read_count > 125 {
            return Err(ConfigError::Invalid(format!(
                "read_count exceeds 125: {}",
                self.registers.read_count
            )));
        }
        if self.registers.write_epoch_count != 2 {
            return Err(ConfigError::Invalid(format!(
                "write_epoch_count must be 2 (hi, lo), got {}",
                self.registers.write_epoch_count
            )));
        }
        let epoch_start = self.registers.write_epoch_address;
        let epoch_registers = epoch_start..=epoch_start.saturating_add(1);
        if self.registers.write_ms_enabled
            && epoch_registers.contains(&self.registers.write_ms_address)
        {
            return Err(ConfigError::Invalid(format!(
                "write_ms_address {} overlaps the epoch registers",
                self.registers.write_ms_address
            )));
        }
        if let Some(target) = self.devices.iter().find(|d| d.host.is_empty()) {
            return Err(ConfigError::Invalid(format!("device with empty host: {target}")));
        }
        Ok(())
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
