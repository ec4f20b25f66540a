//! Connection to the Modbus device.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, info};

use crate::register_map::{ModbusSettings, Parity, TransportConfig};

/// Errors returned by a [`Transport`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// The device cannot be reached. Every further request would fail the
    /// same way until a reconnect.
    #[error("Connection error: {0}")]
    Connection(String),
    /// The device answered with an error for this request. The connection
    /// is still usable.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether the connection is unusable.
    pub fn is_connection(&self) -> bool {
        matches!(self, TransportError::Connection(_))
    }
}

/// A channel able to read holding registers from a Modbus device.
#[async_trait]
pub trait Transport: Send {
    /// Whether a connection is currently open.
    fn is_connected(&self) -> bool;

    /// Open the connection unless it is already open.
    ///
    /// Makes a single attempt; retrying is left to the caller.
    async fn ensure_connected(&mut self) -> Result<(), TransportError>;

    /// Read `count` holding registers starting at `address` from `device_id`.
    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
        device_id: u8,
    ) -> Result<Vec<u16>, TransportError>;
}

/// The single long-lived connection to the device, over TCP or a serial line.
pub struct ModbusSession {
    config: TransportConfig,
    timeout: Duration,
    device_id: u8,
    ctx: Option<Context>,
}

impl ModbusSession {
    /// Create a session. No connection is made until first use.
    pub fn new(config: TransportConfig, timeout: Duration, device_id: u8) -> Self {
        Self {
            config,
            timeout,
            device_id,
            ctx: None,
        }
    }

    /// Create a session from validated settings.
    pub fn from_settings(settings: &ModbusSettings) -> Self {
        Self::new(
            settings.transport.clone(),
            settings.timeout,
            settings.device_id,
        )
    }

    /// The transport this session connects over.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

/// Open a new client context. Makes exactly one attempt.
async fn connect(
    config: &TransportConfig,
    timeout: Duration,
    device_id: u8,
) -> Result<Context, TransportError> {
    let slave = Slave(device_id);

    match config {
        TransportConfig::Tcp { host, port } => {
            let attempt = async {
                let addr = tokio::net::lookup_host((host.as_str(), *port))
                    .await
                    .map_err(|e| {
                        TransportError::Connection(format!("Cannot resolve {}: {}", host, e))
                    })?
                    .next()
                    .ok_or_else(|| {
                        TransportError::Connection(format!("No address found for {}", host))
                    })?;

                tcp::connect_slave(addr, slave)
                    .await
                    .map_err(|e| TransportError::Connection(e.to_string()))
            };

            tokio::time::timeout(timeout, attempt)
                .await
                .map_err(|_| TransportError::Connection("Connection timeout".to_string()))?
        }
        TransportConfig::Rtu {
            path,
            baud_rate,
            parity,
            byte_size,
            stop_bits,
        } => {
            let parity = match parity {
                Parity::None => tokio_serial::Parity::None,
                Parity::Even => tokio_serial::Parity::Even,
                Parity::Odd => tokio_serial::Parity::Odd,
            };

            let stop_bits = match stop_bits {
                2 => tokio_serial::StopBits::Two,
                _ => tokio_serial::StopBits::One,
            };

            let data_bits = match byte_size {
                5 => tokio_serial::DataBits::Five,
                6 => tokio_serial::DataBits::Six,
                7 => tokio_serial::DataBits::Seven,
                _ => tokio_serial::DataBits::Eight,
            };

            let builder = tokio_serial::new(path, *baud_rate)
                .parity(parity)
                .stop_bits(stop_bits)
                .data_bits(data_bits)
                .timeout(timeout);

            let serial = tokio_serial::SerialStream::open(&builder).map_err(|e| {
                TransportError::Connection(format!("Serial open failed: {}", e))
            })?;

            Ok(rtu::attach_slave(serial, slave))
        }
    }
}

#[async_trait]
impl Transport for ModbusSession {
    fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    async fn ensure_connected(&mut self) -> Result<(), TransportError> {
        if self.ctx.is_some() {
            return Ok(());
        }

        debug!(transport = %self.config, "Connecting");
        let ctx = connect(&self.config, self.timeout, self.device_id).await?;
        info!(transport = %self.config, "Connected to Modbus device");
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
        device_id: u8,
    ) -> Result<Vec<u16>, TransportError> {
        let ctx = self
            .ctx
            .as_mut()
            .ok_or_else(|| TransportError::Connection("Not connected".to_string()))?;

        ctx.set_slave(Slave(device_id));
        let result =
            tokio::time::timeout(self.timeout, ctx.read_holding_registers(address, count)).await;

        match result {
            Ok(Ok(Ok(words))) => Ok(words),
            Ok(Ok(Err(exception))) => Err(TransportError::Protocol(format!(
                "Exception: {:?}",
                exception
            ))),
            Ok(Err(tokio_modbus::Error::Transport(e))) => {
                // A broken channel is reopened on the next cycle.
                self.ctx = None;
                Err(TransportError::Connection(e.to_string()))
            }
            Ok(Err(e)) => Err(TransportError::Protocol(e.to_string())),
            Err(_) => {
                // A late reply would be read as the answer to the next request.
                self.ctx = None;
                Err(TransportError::Connection(format!(
                    "No response within {:?}",
                    self.timeout
                )))
            }
        }
    }
}
