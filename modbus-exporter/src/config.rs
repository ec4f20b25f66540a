//! Configuration for the Modbus exporter.
//!
//! This is the raw configuration tree as read from the JSON5 file. It is turned
//! into validated [`ModbusSettings`](crate::register_map::ModbusSettings) once at
//! startup.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use modbus_exporter_common::LoggingConfig;

use crate::reader::WordOrder;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] modbus_exporter_common::Error),
    #[error("No modbus config defined.")]
    MissingModbus,
    #[error("Invalid modbus mode '{0}' (use tcp or rtu)")]
    InvalidMode(String),
    #[error(
        "Data type '{data_type}' of register '{register}' is not implemented; valid types: {valid}"
    )]
    UnsupportedDataType {
        register: String,
        data_type: String,
        valid: String,
    },
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// HTTP scrape endpoint settings.
    #[serde(default)]
    pub http: HttpConfig,

    /// Modbus device settings. Required, but kept optional here so a missing
    /// section is reported as [`ConfigError::MissingModbus`].
    #[serde(default)]
    pub modbus: Option<ModbusSection>,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Address to listen on (default: "0.0.0.0:9502").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for metrics endpoint (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_listen() -> String {
    "0.0.0.0:9502".to_string()
}

fn default_path() -> String {
    "/metrics".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
        }
    }
}

/// The `modbus` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusSection {
    /// Transport mode: "tcp" or "rtu" (case-insensitive). Defaults to tcp.
    #[serde(default)]
    pub mode: Option<String>,

    /// TCP transport parameters (used when mode is tcp)
    #[serde(default)]
    pub tcp: TcpSection,

    /// Serial line parameters (used when mode is rtu)
    #[serde(default)]
    pub rtu: RtuSection,

    /// Per-operation timeout in seconds (default: 1 for rtu, 3 for tcp)
    #[serde(default)]
    pub timeout: Option<f64>,

    /// Modbus unit/slave ID. Range-checked when building
    /// [`ModbusSettings`](crate::register_map::ModbusSettings).
    #[serde(default = "default_device_id")]
    pub device_id: i64,

    /// Name of the label carrying the device ID
    #[serde(default = "default_device_label")]
    pub device_label: String,

    /// Word order of 32-bit values
    #[serde(default)]
    pub word_order: WordOrder,

    /// Metric group name -> ("help" or "help:type") -> register address.
    /// Addresses are range-checked when building the register map.
    #[serde(default)]
    pub registers: IndexMap<String, IndexMap<String, i64>>,
}

fn default_device_id() -> i64 {
    1
}

fn default_device_label() -> String {
    "device_id".to_string()
}

/// Modbus TCP parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpSection {
    /// Host address (IP or hostname)
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port (default: 502)
    #[serde(default = "default_tcp_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_tcp_port() -> u16 {
    502
}

impl Default for TcpSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_tcp_port(),
        }
    }
}

/// Modbus RTU (serial) parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtuSection {
    /// Serial port path (e.g., "/dev/ttyUSB0" or "COM1")
    #[serde(default = "default_serial_port")]
    pub port: String,
    /// Baud rate (default: 9600)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Parity: "N", "E", "O" or "none", "even", "odd" (default: "N")
    #[serde(default = "default_parity")]
    pub parity: String,
    /// Data bits per character (default: 8)
    #[serde(default = "default_byte_size")]
    pub byte_size: u8,
    /// Stop bits: 1 or 2 (default: 1)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
}

fn default_serial_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_parity() -> String {
    "N".to_string()
}

fn default_byte_size() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

impl Default for RtuSection {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            baud_rate: default_baud_rate(),
            parity: default_parity(),
            byte_size: default_byte_size(),
            stop_bits: default_stop_bits(),
        }
    }
}

impl ExporterConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: ExporterConfig = modbus_exporter_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ExporterConfig = modbus_exporter_common::parse_config(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the HTTP settings.
    ///
    /// The `modbus` section is validated separately by
    /// [`ModbusSettings::from_config`](crate::register_map::ModbusSettings::from_config).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.http.listen
            )));
        }

        if !self.http.path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }

        Ok(())
    }
}
