//! Validated register table and transport settings.
//!
//! Everything here is built once at startup from [`ExporterConfig`]. A config
//! that fails any check here never reaches the poll loop.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use indexmap::IndexMap;
use modbus_exporter_common::metric::is_valid_label_name;
use tracing::warn;

use crate::config::{ConfigError, ExporterConfig, ModbusSection};
use crate::reader::WordOrder;

/// Register value interpretation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DataType {
    /// Signed 16-bit integer (default)
    #[default]
    Int16,
    /// Unsigned 16-bit integer
    Uint16,
    /// Signed 32-bit integer (2 registers)
    Int32,
    /// Unsigned 32-bit integer (2 registers)
    Uint32,
    /// IEEE-754 single precision float (2 registers)
    Float32,
}

impl DataType {
    /// Every supported data type.
    pub const ALL: [DataType; 5] = [
        DataType::Int16,
        DataType::Uint16,
        DataType::Int32,
        DataType::Uint32,
        DataType::Float32,
    ];

    /// Return the configuration name for this data type.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Int16 => "int16",
            DataType::Uint16 => "uint16",
            DataType::Int32 => "int32",
            DataType::Uint32 => "uint32",
            DataType::Float32 => "float32",
        }
    }

    /// Number of 16-bit registers holding one value.
    pub fn register_count(&self) -> u16 {
        match self {
            DataType::Int16 | DataType::Uint16 => 1,
            DataType::Int32 | DataType::Uint32 | DataType::Float32 => 2,
        }
    }

    fn valid_names() -> String {
        Self::ALL
            .iter()
            .map(DataType::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = ();

    /// Parse a data type name, ignoring case and surrounding whitespace.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|data_type| data_type.as_str() == name)
            .ok_or(())
    }
}

/// One register to poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterSpec {
    /// Descriptive name, used as the HELP text
    pub help: String,
    /// Value interpretation
    pub data_type: DataType,
    /// Starting register address
    pub address: u16,
}

impl RegisterSpec {
    /// Parse a `"help"` or `"help:type"` key.
    pub fn parse(key: &str, address: u16) -> Result<Self, ConfigError> {
        let (help, data_type) = match key.split_once(':') {
            Some((help, type_name)) => {
                let data_type = type_name.parse::<DataType>().map_err(|()| {
                    ConfigError::UnsupportedDataType {
                        register: help.trim().to_string(),
                        data_type: type_name.trim().to_lowercase(),
                        valid: DataType::valid_names(),
                    }
                })?;
                (help, data_type)
            }
            None => (key, DataType::default()),
        };

        Ok(Self {
            help: help.trim().to_string(),
            data_type,
            address,
        })
    }

    /// Number of registers to request.
    pub fn register_count(&self) -> u16 {
        self.data_type.register_count()
    }
}

/// A metric group and its registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterGroup {
    /// Metric name shared by every register in the group
    pub name: String,
    /// Registers, in configuration order
    pub registers: Vec<RegisterSpec>,
}

/// Ordered table of registers to poll, grouped by metric name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterMap {
    groups: Vec<RegisterGroup>,
}

impl RegisterMap {
    /// Build the table from the `registers` config section.
    ///
    /// Addresses must fit the 16-bit register space, including the second
    /// word of 32-bit types.
    pub fn from_config(
        registers: &IndexMap<String, IndexMap<String, i64>>,
    ) -> Result<Self, ConfigError> {
        let groups = registers
            .iter()
            .map(|(name, entries)| {
                let registers = entries
                    .iter()
                    .map(|(key, address)| parse_entry(name, key, *address))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(RegisterGroup {
                    name: name.clone(),
                    registers,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Self { groups })
    }

    /// Metric groups, in configuration order.
    pub fn groups(&self) -> &[RegisterGroup] {
        &self.groups
    }

    /// Iterate over `(group name, register)` pairs in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RegisterSpec)> {
        self.groups.iter().flat_map(|group| {
            group
                .registers
                .iter()
                .map(move |spec| (group.name.as_str(), spec))
        })
    }

    /// Total number of registers.
    pub fn len(&self) -> usize {
        self.groups.iter().map(|g| g.registers.len()).sum()
    }

    /// Whether there is nothing to poll.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn parse_entry(group: &str, key: &str, address: i64) -> Result<RegisterSpec, ConfigError> {
    let out_of_range = || {
        ConfigError::Validation(format!(
            "register '{}' in '{}': address {} is outside 0-65535",
            key, group, address
        ))
    };

    let start = u16::try_from(address).map_err(|_| out_of_range())?;
    let spec = RegisterSpec::parse(key, start)?;

    if u32::from(start) + u32::from(spec.register_count()) - 1 > u32::from(u16::MAX) {
        return Err(ConfigError::Validation(format!(
            "register '{}' in '{}': {} at address {} runs past 65535",
            key, group, spec.data_type, start
        )));
    }

    Ok(spec)
}

/// Serial parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

impl Parity {
    /// Letter used in the usual `8N1` notation.
    pub fn as_char(&self) -> char {
        match self {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        }
    }
}

impl FromStr for Parity {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "n" | "none" => Ok(Parity::None),
            "e" | "even" => Ok(Parity::Even),
            "o" | "odd" => Ok(Parity::Odd),
            _ => Err(ConfigError::Validation(format!(
                "invalid parity '{}' (use N, E or O)",
                s
            ))),
        }
    }
}

/// How to reach the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConfig {
    /// Modbus TCP connection
    Tcp { host: String, port: u16 },
    /// Modbus RTU (serial) connection
    Rtu {
        path: String,
        baud_rate: u32,
        parity: Parity,
        byte_size: u8,
        stop_bits: u8,
    },
}

impl TransportConfig {
    /// Return the mode name ("tcp" or "rtu").
    pub fn mode(&self) -> &'static str {
        match self {
            TransportConfig::Tcp { .. } => "tcp",
            TransportConfig::Rtu { .. } => "rtu",
        }
    }
}

impl fmt::Display for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportConfig::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            TransportConfig::Rtu {
                path,
                baud_rate,
                parity,
                byte_size,
                stop_bits,
            } => write!(
                f,
                "rtu:{} {} {}{}{}",
                path,
                baud_rate,
                byte_size,
                parity.as_char(),
                stop_bits
            ),
        }
    }
}

const DEFAULT_TCP_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_RTU_TIMEOUT: Duration = Duration::from_secs(1);

/// Validated `modbus` section.
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusSettings {
    /// Transport selection and parameters
    pub transport: TransportConfig,
    /// Per-operation timeout
    pub timeout: Duration,
    /// Modbus unit/slave ID
    pub device_id: u8,
    /// Label name carrying the device ID
    pub device_label: String,
    /// Word order of 32-bit values
    pub word_order: WordOrder,
    /// Registers to poll
    pub registers: RegisterMap,
}

impl ModbusSettings {
    /// Validate the `modbus` section of `config`.
    pub fn from_config(config: &ExporterConfig) -> Result<Self, ConfigError> {
        let section = config.modbus.as_ref().ok_or(ConfigError::MissingModbus)?;
        Self::from_section(section)
    }

    /// Validate a `modbus` section.
    pub fn from_section(section: &ModbusSection) -> Result<Self, ConfigError> {
        let transport = build_transport(section)?;

        let timeout = match section.timeout {
            Some(secs) if secs.is_finite() && secs > 0.0 => Duration::from_secs_f64(secs),
            Some(secs) => {
                return Err(ConfigError::Validation(format!(
                    "timeout must be a positive number of seconds, got {}",
                    secs
                )));
            }
            None => match transport {
                TransportConfig::Tcp { .. } => DEFAULT_TCP_TIMEOUT,
                TransportConfig::Rtu { .. } => DEFAULT_RTU_TIMEOUT,
            },
        };

        let device_id = u8::try_from(section.device_id).map_err(|_| {
            ConfigError::Validation(format!(
                "device_id must be 0-255, got {}",
                section.device_id
            ))
        })?;

        if matches!(transport, TransportConfig::Rtu { .. }) && !(1..=247).contains(&device_id) {
            return Err(ConfigError::Validation(format!(
                "device_id must be 1-247 for rtu, got {}",
                device_id
            )));
        }

        if !is_valid_label_name(&section.device_label) || section.device_label == "address" {
            return Err(ConfigError::Validation(format!(
                "device_label '{}' is not a usable label name",
                section.device_label
            )));
        }

        let registers = RegisterMap::from_config(&section.registers)?;
        if registers.is_empty() {
            warn!("No registers configured, scrapes will only return exporter metrics");
        }

        Ok(Self {
            transport,
            timeout,
            device_id,
            device_label: section.device_label.clone(),
            word_order: section.word_order,
            registers,
        })
    }
}

fn build_transport(section: &ModbusSection) -> Result<TransportConfig, ConfigError> {
    let mode = match &section.mode {
        Some(mode) => mode.trim().to_lowercase(),
        None => {
            warn!("No modbus mode defined, defaulting to tcp");
            "tcp".to_string()
        }
    };

    match mode.as_str() {
        "tcp" => Ok(TransportConfig::Tcp {
            host: section.tcp.host.clone(),
            port: section.tcp.port,
        }),
        "rtu" => {
            let rtu = &section.rtu;
            let parity = rtu.parity.parse::<Parity>()?;

            if !(5..=8).contains(&rtu.byte_size) {
                return Err(ConfigError::Validation(format!(
                    "byte_size must be 5-8, got {}",
                    rtu.byte_size
                )));
            }

            if !matches!(rtu.stop_bits, 1 | 2) {
                return Err(ConfigError::Validation(format!(
                    "stop_bits must be 1 or 2, got {}",
                    rtu.stop_bits
                )));
            }

            Ok(TransportConfig::Rtu {
                path: rtu.port.clone(),
                baud_rate: rtu.baud_rate,
                parity,
                byte_size: rtu.byte_size,
                stop_bits: rtu.stop_bits,
            })
        }
        _ => Err(ConfigError::InvalidMode(
            section.mode.clone().unwrap_or_default(),
        )),
    }
}
