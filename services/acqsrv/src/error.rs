//! Error handling for the acquisition service.

use thiserror::Error;

/// Acquisition service error type.
#[derive(Error, Debug, Clone)]
pub enum AcqSrvError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    IoError(String),

    /// Data handling errors (serialization, parsing, conversion)
    #[error("Data error: {0}")]
    DataError(String),

    /// Storage backend errors (HTTP store, database)
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Protocol link errors
    #[error("Link error: {0}")]
    LinkError(String),
}

/// Result type alias for the acquisition service.
pub type Result<T> = std::result::Result<T, AcqSrvError>;

impl AcqSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        AcqSrvError::ConfigError(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        AcqSrvError::IoError(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        AcqSrvError::DataError(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        AcqSrvError::StorageError(msg.into())
    }

    pub fn link(msg: impl Into<String>) -> Self {
        AcqSrvError::LinkError(msg.into())
    }
}

impl From<fieldbus::LinkError> for AcqSrvError {
    fn from(err: fieldbus::LinkError) -> Self {
        AcqSrvError::LinkError(err.to_string())
    }
}

impl From<std::io::Error> for AcqSrvError {
    fn from(err: std::io::Error) -> Self {
        AcqSrvError::IoError(err.to_string())
    }
}

impl From<sqlx::Error> for AcqSrvError {
    fn from(err: sqlx::Error) -> Self {
        AcqSrvError::StorageError(err.to_string())
    }
}
