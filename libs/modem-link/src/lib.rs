//! Modem Link Library
//!
//! Core abstractions shared by every modem protocol family used by modemsrv.
//!
//! # Architecture
//!
//! This library provides:
//! - **Core Traits**: `Protocol` (frame codec + response correlation rules) and
//!   `Transport` (the byte sink a channel writes to)
//! - **Correlation Engine**: `Channel`, which serializes requests onto one
//!   device connection and maps every response back to exactly one caller
//! - **Notification Dispatcher**: pattern registrations for unsolicited frames
//! - **Errors**: `LinkError` for rejected operations, `RequestError` for the
//!   terminal failure outcomes of a request
//!
//! ```text
//! facade ──submit──► Channel ──write──► Transport
//!                       ▲
//!   bytes ──on_bytes_received──► Protocol::decode ──► frame
//!                       │
//!        in-flight match? ──yes──► completion callback
//!                       └─no──► Dispatcher ──► notification callbacks
//! ```

pub mod engine;
pub mod error;
pub mod traits;

// Re-export core types
pub use engine::{
    Channel, ChannelStats, Completion, Handler, RegistrationId, RequestHandle, DEFAULT_MAX_IN_FLIGHT,
};
pub use error::{LinkError, RequestError, RequestResult, Result};
pub use traits::{
    ChannelLogger, ChannelState, Decoded, DispatchPolicy, Disposition, Protocol, TransactionId,
    Transport, TransportError,
};
