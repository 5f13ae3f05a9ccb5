//! Link error taxonomy.
//!
//! Every failure surfaced by a [`crate::RegisterLink`] is folded into
//! [`LinkError`]. The split that matters to callers is
//! [`LinkError::is_recoverable`]: a recoverable failure means the request
//! was rejected or timed out but the link itself is still usable, while an
//! unrecoverable failure means the link must be closed and reopened.

use std::io;

use thiserror::Error;

/// Protocol-level rejection codes reported by a device or gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailedToRespond,
}

impl std::fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let desc = match self {
            ExceptionCode::IllegalFunction => "illegal function",
            ExceptionCode::IllegalDataAddress => "illegal data address",
            ExceptionCode::IllegalDataValue => "illegal data value",
            ExceptionCode::ServerDeviceFailure => "server device failure",
            ExceptionCode::Acknowledge => "acknowledge",
            ExceptionCode::ServerDeviceBusy => "server device busy",
            ExceptionCode::MemoryParityError => "memory parity error",
            ExceptionCode::GatewayPathUnavailable => "gateway path unavailable",
            ExceptionCode::GatewayTargetFailedToRespond => "gateway target failed to respond",
        };
        f.write_str(desc)
    }
}

impl ExceptionCode {
    /// Whether a request rejected with this code leaves the link usable.
    ///
    /// `Acknowledge` is the odd one out: the device accepted the request
    /// and will process it later, which a simple polling read cannot wait
    /// for, so it is treated like a transport fault.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ExceptionCode::Acknowledge)
    }
}

/// Link-level failure.
#[derive(Debug, Clone, Error)]
pub enum LinkError {
    /// Invalid link configuration (bad URL scheme, unusable address).
    #[error("link configuration error: {0}")]
    Config(String),

    /// Operation attempted while the link is closed.
    #[error("link is not open")]
    NotOpen,

    /// The device rejected the request at the protocol level.
    #[error("protocol exception: {0}")]
    Exception(ExceptionCode),

    /// The request did not complete within the configured timeout.
    #[error("request timed out")]
    Timeout,

    /// Transport-level I/O failure.
    #[error("i/o error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, LinkError>;

impl LinkError {
    pub fn config(msg: impl Into<String>) -> Self {
        LinkError::Config(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        LinkError::Io(msg.into())
    }

    /// Whether the failed request can simply be skipped, leaving the link
    /// open for the next one.
    pub fn is_recoverable(&self) -> bool {
        match self {
            LinkError::Exception(code) => code.is_recoverable(),
            LinkError::Timeout => true,
            LinkError::Config(_) | LinkError::NotOpen | LinkError::Io(_) => false,
        }
    }

    /// Classify an `std::io::Error` coming out of the protocol client.
    ///
    /// tokio-modbus 0.9 folds protocol exception responses into
    /// `io::Error`, so the exception code has to be recovered from the
    /// error text before everything else is treated as a transport fault.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => return LinkError::Timeout,
            _ => {}
        }

        let text = err.to_string();
        for (needle, code) in [
            ("Illegal function", ExceptionCode::IllegalFunction),
            ("Illegal data address", ExceptionCode::IllegalDataAddress),
            ("Illegal data value", ExceptionCode::IllegalDataValue),
            ("Server device failure", ExceptionCode::ServerDeviceFailure),
            ("Acknowledge", ExceptionCode::Acknowledge),
            ("Server device busy", ExceptionCode::ServerDeviceBusy),
            ("Memory parity error", ExceptionCode::MemoryParityError),
            (
                "Gateway path unavailable",
                ExceptionCode::GatewayPathUnavailable,
            ),
            (
                "Gateway target device",
                ExceptionCode::GatewayTargetFailedToRespond,
            ),
        ] {
            if text.contains(needle) {
                return LinkError::Exception(code);
            }
        }

        LinkError::Io(text)
    }
}
