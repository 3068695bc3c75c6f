//! Core Link Traits
//!
//! This module defines the seams between the correlation engine and the
//! protocol families plugged into it. The engine never looks at raw bytes: a
//! `Protocol` turns bytes into frames and tells the engine how a frame relates
//! to a pending command.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{LinkError, RequestResult};

pub use crate::error::TransportError;

// ============================================================================
// Channel State
// ============================================================================

/// Lifecycle state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ChannelState {
    /// Accepting requests
    #[default]
    Open,
    /// Failing outstanding requests during teardown
    Closing,
    /// Detached from the transport, rejects every request
    Closed,
}

impl ChannelState {
    /// Check if the channel accepts new requests
    pub fn is_open(&self) -> bool {
        matches!(self, ChannelState::Open)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Open => write!(f, "OPEN"),
            ChannelState::Closing => write!(f, "CLOSING"),
            ChannelState::Closed => write!(f, "CLOSED"),
        }
    }
}

// ============================================================================
// Correlation Types
// ============================================================================

/// Transaction identifier for keyed protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u32);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

/// How many requests may be outstanding on one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchPolicy {
    /// One outstanding request; completion order equals submission order
    StrictFifo,
    /// Several outstanding requests told apart by transaction id
    TransactionKeyed,
}

/// Relation between a received frame and a pending command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Part of the response, more frames follow
    Intermediate,
    /// Terminates the response
    Final,
    /// Not addressed to this command
    Unrelated,
}

/// Result of one decode attempt over the receive buffer
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<F> {
    /// A complete frame occupying the first `consumed` bytes
    Frame { consumed: usize, frame: F },
    /// The buffer holds a partial frame
    NeedMoreData,
    /// The first `skip` bytes cannot start a valid frame and must be dropped
    Invalid { skip: usize, reason: String },
}

// ============================================================================
// Core Traits
// ============================================================================

/// A protocol family: frame codec plus response correlation rules
///
/// One implementation exists per family (AT, QMI, MBIM) and is chosen when
/// the channel is constructed.
pub trait Protocol: Send + 'static {
    /// Logical request submitted by a facade
    type Command: Send + fmt::Debug + 'static;
    /// Decoded wire message
    type Frame: Send + fmt::Debug + 'static;
    /// Typed result handed to the completion callback
    type Response: Send + fmt::Debug + 'static;
    /// Notification match pattern
    type Pattern: Send + fmt::Debug + 'static;

    /// Protocol name used in logs
    fn name(&self) -> &'static str;

    /// Concurrency policy of the wire protocol
    fn policy(&self) -> DispatchPolicy;

    /// Largest transaction id the wire header can carry (keyed protocols)
    fn max_transaction_id(&self) -> u32 {
        u32::from(u16::MAX)
    }

    /// Serialize a command; `transaction_id` is set for keyed protocols
    fn encode(
        &mut self,
        command: &Self::Command,
        transaction_id: Option<TransactionId>,
    ) -> Result<Bytes, LinkError>;

    /// Try to extract one frame from the start of `buf`
    fn decode(&mut self, buf: &[u8]) -> Decoded<Self::Frame>;

    /// Transaction id carried by a response frame (keyed protocols)
    fn transaction_id(&self, _frame: &Self::Frame) -> Option<TransactionId> {
        None
    }

    /// Relate a frame to the pending command it was routed to
    fn classify(&self, command: &Self::Command, frame: &Self::Frame) -> Disposition;

    /// Build the typed response from the collected frames
    fn complete(
        &self,
        command: &Self::Command,
        intermediates: Vec<Self::Frame>,
        terminal: Self::Frame,
    ) -> RequestResult<Self::Response>;

    /// Check whether an unsolicited frame matches a notification pattern
    fn matches(&self, pattern: &Self::Pattern, frame: &Self::Frame) -> bool;
}

/// Byte sink towards the device
///
/// The channel never opens, configures or closes the transport; it only
/// writes to it. Received bytes and link loss are delivered by whoever owns
/// the device I/O through `Channel::on_bytes_received` and
/// `Channel::on_transport_closed`.
pub trait Transport: Send {
    /// Queue bytes for the device. An error means the bytes were rejected.
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;
}

// ============================================================================
// Channel Logger
// ============================================================================

/// Lightweight logger for channel-specific logging
#[derive(Debug, Clone)]
pub struct ChannelLogger {
    pub channel_id: u32,
    pub channel_name: String,
}

impl ChannelLogger {
    /// Create new channel logger
    pub fn new(channel_id: u32, channel_name: impl Into<String>) -> Self {
        Self {
            channel_id,
            channel_name: channel_name.into(),
        }
    }

    fn emit(&self, level: tracing::Level, message: &str) {
        let id = self.channel_id;
        let name = self.channel_name.as_str();
        match level {
            tracing::Level::TRACE => tracing::trace!(channel_id = id, channel = name, "{}", message),
            tracing::Level::DEBUG => tracing::debug!(channel_id = id, channel = name, "{}", message),
            tracing::Level::INFO => tracing::info!(channel_id = id, channel = name, "{}", message),
            tracing::Level::WARN => tracing::warn!(channel_id = id, channel = name, "{}", message),
            tracing::Level::ERROR => tracing::error!(channel_id = id, channel = name, "{}", message),
        }
    }

    /// Log initialization step
    pub fn log_init(&self, protocol: &str, message: &str) {
        self.emit(
            tracing::Level::INFO,
            &format!("[INIT] {} - {}", protocol, message),
        );
    }

    /// Log channel state change
    pub fn log_status(&self, old_state: ChannelState, new_state: ChannelState, reason: &str) {
        self.emit(
            tracing::Level::INFO,
            &format!("[STATUS] {} -> {} - {}", old_state, new_state, reason),
        );
    }

    /// Log raw frame in hex format
    pub fn log_raw_frame(&self, direction: &str, data: &[u8]) {
        self.emit(
            tracing::Level::DEBUG,
            &format!("[{}] {}B [{}]", direction, data.len(), hex_string(data)),
        );
    }

    /// Log a decoded frame
    pub fn log_frame(&self, direction: &str, frame: &dyn fmt::Debug) {
        self.emit(tracing::Level::TRACE, &format!("[{}] {:?}", direction, frame));
    }

    /// Log a frame that matched no request and no registration
    pub fn log_unroutable(&self, frame: &dyn fmt::Debug) {
        self.emit(
            tracing::Level::WARN,
            &format!("[UNROUTABLE] discarding {:?}", frame),
        );
    }

    /// Log bytes dropped while resynchronizing
    pub fn log_invalid(&self, skipped: usize, reason: &str) {
        self.emit(
            tracing::Level::WARN,
            &format!("[RESYNC] dropped {}B - {}", skipped, reason),
        );
    }

    /// Log a late response for a cancelled request
    pub fn log_tombstone(&self, frame: &dyn fmt::Debug) {
        self.emit(
            tracing::Level::DEBUG,
            &format!("[TOMBSTONE] late response discarded {:?}", frame),
        );
    }
}

/// Format bytes as space separated upper-case hex
pub fn hex_string(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// Tests
// ============================================================================
