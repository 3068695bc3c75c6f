//! Error handling for Modem Service
//!
//! Channel-level failures come from `modem_link`; this module wraps them
//! together with configuration, I/O and start-up failures of the daemon.

use modem_link::{LinkError, RequestError};
use thiserror::Error;

use crate::facade::GprsError;

/// Modem Service Error Type
#[derive(Error, Debug, Clone)]
pub enum ModemSrvError {
    /// Configuration loading and validation errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    IoError(String),

    /// Transport open failures (serial, socket)
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Requests refused synchronously by a channel
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    /// Terminal request failures
    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    /// Data-context facade failures
    #[error("Data context error: {0}")]
    DataContext(#[from] GprsError),

    /// No driver registered for a protocol
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// The channel task of a modem has exited
    #[error("Channel task stopped: {0}")]
    ChannelStopped(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type alias for Modem Service
pub type Result<T> = std::result::Result<T, ModemSrvError>;

impl ModemSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        ModemSrvError::ConfigError(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        ModemSrvError::IoError(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        ModemSrvError::ConnectionError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ModemSrvError::InternalError(msg.into())
    }
}

impl From<std::io::Error> for ModemSrvError {
    fn from(err: std::io::Error) -> Self {
        ModemSrvError::IoError(err.to_string())
    }
}

impl From<figment::Error> for ModemSrvError {
    fn from(err: figment::Error) -> Self {
        ModemSrvError::ConfigError(err.to_string())
    }
}

impl From<tokio_serial::Error> for ModemSrvError {
    fn from(err: tokio_serial::Error) -> Self {
        ModemSrvError::ConnectionError(err.to_string())
    }
}
