//! Prometheus exporter for Modbus devices.
//!
//! Every scrape of the metrics endpoint reads the configured holding registers
//! from one device, over Modbus TCP or RTU, and returns the decoded values as
//! gauges.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │  Modbus device  │<───>│    Collector    │<────│   HTTP Server   │
//! │   (TCP / RTU)   │     │  (poll cycle)   │     │   (/metrics)    │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! modbus-exporter --config modbus-exporter.json5
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod collector;
pub mod config;
pub mod http;
pub mod reader;
pub mod register_map;
pub mod transport;

pub use collector::{CycleOutcome, MetricCollector, PollCycle, SharedCollector};
pub use config::{ConfigError, ExporterConfig};
pub use http::HttpServer;
pub use reader::{RegisterReader, WordOrder};
pub use register_map::{DataType, ModbusSettings, RegisterMap, RegisterSpec, TransportConfig};
pub use transport::{ModbusSession, Transport, TransportError};
