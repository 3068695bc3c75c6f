//! modemsrv Protocol Families
//!
//! Each family implements `modem_link::Protocol`: the frame codec plus the
//! rules relating frames to pending commands. Families are feature-gated for
//! selective compilation.
//!
//! # Features
//!
//! - `at` - line-oriented AT command chat (STRICT_FIFO)
//! - `qmi` - QMUX framed QMI services (TRANSACTION_KEYED)
//! - `mbim` - MBIM control messages (TRANSACTION_KEYED)

#[cfg(feature = "at")]
pub mod at;

#[cfg(feature = "mbim")]
pub mod mbim;

#[cfg(feature = "qmi")]
pub mod qmi;

// Re-export common types for convenience
pub use modem_link::{
    Channel, ChannelLogger, DispatchPolicy, LinkError, Protocol, RequestError, RequestResult,
};
