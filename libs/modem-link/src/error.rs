//! Modem Link Error Types
//!
//! `LinkError` covers operations the engine refuses synchronously.
//! `RequestError` is the set of terminal failure outcomes a submitted request
//! can resolve to. The two never overlap: a request that was accepted by
//! `Channel::submit` only ever reports a `RequestError`.

use thiserror::Error;

/// Result type for modem-link operations
pub type Result<T> = std::result::Result<T, LinkError>;

/// Outcome delivered to a request's completion callback
pub type RequestResult<T> = std::result::Result<T, RequestError>;

/// Errors returned synchronously by channel operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The channel is closing or closed; nothing was queued
    #[error("Channel closed")]
    ChannelClosed,

    /// The request could not be serialized by the protocol codec
    #[error("Encode error: {0}")]
    Encode(String),

    /// No free transaction id is left in the protocol's id space
    #[error("Transaction ids exhausted")]
    TransactionIdsExhausted,
}

impl LinkError {
    pub fn encode(msg: impl Into<String>) -> Self {
        LinkError::Encode(msg.into())
    }
}

/// Errors reported by a transport write
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The link is gone
    #[error("Transport disconnected")]
    Disconnected,

    /// The bytes were refused for another reason
    #[error("Write rejected: {0}")]
    Rejected(String),
}

/// Terminal failure outcomes of a submitted request
///
/// Success is the `Ok` side of [`RequestResult`]. Every submitted request
/// resolves to exactly one of success or one of these variants.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The transport disconnected or the channel was closed
    #[error("Channel closed")]
    ChannelClosed,

    /// The caller withdrew the request
    #[error("Request cancelled")]
    Cancelled,

    /// A frame matched the request but its payload could not be parsed
    #[error("Decode failure: {0}")]
    DecodeFailure(String),

    /// The device answered with a well-formed error response
    #[error("Device error {code}: {message}")]
    DeviceError { code: u32, message: String },
}

impl RequestError {
    pub fn decode(msg: impl Into<String>) -> Self {
        RequestError::DecodeFailure(msg.into())
    }

    pub fn device(code: u32, message: impl Into<String>) -> Self {
        RequestError::DeviceError {
            code,
            message: message.into(),
        }
    }

    /// Device-reported error code, if any
    pub fn device_code(&self) -> Option<u32> {
        match self {
            RequestError::DeviceError { code, .. } => Some(*code),
            _ => None,
        }
    }
}
