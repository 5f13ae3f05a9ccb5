//! Register-protocol link layer for field device acquisition.
//!
//! This crate owns everything below the "read register N from unit U"
//! boundary: link addressing (TCP sockets and serial ports), request
//! timeouts, per-register byte order and 32-bit word order, and the
//! classification of link failures into recoverable and unrecoverable
//! classes.
//!
//! The service layer talks to devices exclusively through the
//! [`RegisterLink`] trait; [`ModbusLink`] is the production implementation
//! backed by `tokio-modbus`.

pub mod codec;
pub mod error;
pub mod link;

pub use error::{ExceptionCode, LinkError, Result};
pub use link::{
    ByteOrder, LinkAddress, LinkConfig, ModbusLink, Parity, RegisterKind, RegisterLink,
    SerialParams, WordOrder,
};
