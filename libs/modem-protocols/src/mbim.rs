//! MBIM Protocol
//!
//! Mobile Broadband Interface Model control messages. Every message starts
//! with a 12-byte little-endian header; commands address a device service by
//! UUID plus a command id (CID).
//!
//! ```text
//! header      type (u32) | length (u32) | transaction id (u32)
//! fragment    total (u32) | current (u32)
//! COMMAND     service UUID | CID | command type | info length | info
//! COMMAND_DONE service UUID | CID | status | info length | info
//! INDICATE_STATUS service UUID | CID | info length | info
//! ```
//!
//! Only single-fragment messages are supported.

mod protocol;

pub use protocol::{
    message_type, CommandType, MbimBody, MbimFrame, MbimPattern, MbimProtocol, MbimRequest,
    MbimResponse, HEADER_LEN, MAX_MESSAGE_LENGTH,
};

#[doc(hidden)]
pub use protocol::encode_device_frame;

use uuid::Uuid;

/// Basic Connect device service
pub const BASIC_CONNECT: Uuid = Uuid::from_bytes([
    0xa2, 0x89, 0xcc, 0x33, 0xbc, 0xbb, 0x8b, 0x4f, 0xb6, 0xb0, 0x13, 0x3e, 0xc2, 0xaa, 0xe6, 0xdf,
]);

/// Basic Connect command ids
pub mod cid {
    pub const DEVICE_CAPS: u32 = 1;
    pub const SUBSCRIBER_READY_STATUS: u32 = 2;
    pub const RADIO_STATE: u32 = 3;
    pub const REGISTER_STATE: u32 = 9;
    pub const PACKET_SERVICE: u32 = 10;
    pub const CONNECT: u32 = 12;
    pub const IP_CONFIGURATION: u32 = 15;
}

/// Human readable name of an MBIM status code
pub fn status_name(code: u32) -> &'static str {
    match code {
        0 => "SUCCESS",
        1 => "BUSY",
        2 => "FAILURE",
        3 => "SIM_NOT_INSERTED",
        4 => "BAD_SIM",
        5 => "PIN_REQUIRED",
        6 => "PIN_DISABLED",
        7 => "NOT_REGISTERED",
        8 => "PROVIDERS_NOT_FOUND",
        9 => "NO_DEVICE_SUPPORT",
        14 => "RADIO_POWER_OFF",
        15 => "ACTIVATION_FAILED",
        16 => "CONTEXT_NOT_ACTIVATED",
        21 => "INVALID_PARAMETERS",
        _ => "UNKNOWN",
    }
}
