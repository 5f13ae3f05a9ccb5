//! acqsrv - field device acquisition and dispatch service
//!
//! Polls register-based field devices over Modbus TCP/RTU links, decodes
//! raw registers into typed engineering measurements, and fans the
//! resulting time series out to console, file, InfluxDB and TimescaleDB
//! backends, each with its own bounded buffering and flush timing.
//!
//! # Architecture
//!
//! ```text
//! Pollers (one per link) ──► Dispatcher tick ──► Sinks (bounded buffers,
//!                                                 background flush tasks)
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod point;
pub mod poller;
pub mod shutdown;
pub mod sink;

pub use config::{AppConfig, PollerSection, SinkSection};
pub use dispatch::Dispatcher;
pub use error::{AcqSrvError, Result};
pub use point::{Point, Value};
pub use poller::{Poller, PollerConfig, Target, ValueKind};
pub use sink::Sink;

pub const SERVICE_NAME: &str = "acqsrv";
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
