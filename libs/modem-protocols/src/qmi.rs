//! QMI Protocol
//!
//! QMUX framed Qualcomm MSM Interface messages. Every service message carries
//! a transaction id, so several requests may be outstanding at once.
//!
//! ```text
//! QMUX frame
//!     ├── marker 0x01
//!     ├── length (u16 LE, excludes the marker)
//!     ├── control flags | service | client id
//!     ├── service header: flags + transaction id (u8 on CTL, u16 LE elsewhere)
//!     └── message id (u16 LE) | TLV length (u16 LE) | TLVs
//! ```

mod message;
mod protocol;

pub use message::{MessageKind, QmiFrame, QmiRequest, QmiResponse, Tlv};
pub use protocol::{QmiPattern, QmiProtocol, MAX_QMUX_LENGTH};

#[doc(hidden)]
pub use protocol::{encode_service_frame, result_tlv};

/// QMI service identifiers
pub mod service {
    pub const CTL: u8 = 0x00;
    pub const WDS: u8 = 0x01;
    pub const DMS: u8 = 0x02;
    pub const NAS: u8 = 0x03;
    pub const WMS: u8 = 0x05;
    pub const UIM: u8 = 0x0B;
}

/// Wireless Data Service messages and TLVs
pub mod wds {
    pub const START_NETWORK_INTERFACE: u16 = 0x0020;
    pub const STOP_NETWORK_INTERFACE: u16 = 0x0021;
    pub const PACKET_SERVICE_STATUS_IND: u16 = 0x0022;
    pub const MODIFY_PROFILE: u16 = 0x0028;
    pub const DELETE_PROFILE: u16 = 0x0029;
    pub const GET_CURRENT_SETTINGS: u16 = 0x002D;

    /// Start Network Interface: profile index (3GPP)
    pub const TLV_PROFILE_INDEX_3GPP: u8 = 0x31;
    /// Start Network Interface response: packet data handle
    pub const TLV_PACKET_DATA_HANDLE: u8 = 0x01;
    /// Modify / Delete Profile: profile identifier (type, index)
    pub const TLV_PROFILE_IDENTIFIER: u8 = 0x01;
    /// Modify Profile: PDP type
    pub const TLV_PDP_TYPE: u8 = 0x11;
    /// Modify Profile: APN name
    pub const TLV_APN_NAME: u8 = 0x14;
    /// Get Current Settings: requested settings mask
    pub const TLV_REQUESTED_SETTINGS: u8 = 0x10;
    /// Get Current Settings response: IPv4 address, gateway and DNS
    pub const TLV_PRIMARY_DNS_V4: u8 = 0x15;
    pub const TLV_SECONDARY_DNS_V4: u8 = 0x16;
    pub const TLV_IPV4_ADDRESS: u8 = 0x1E;
    pub const TLV_IPV4_GATEWAY: u8 = 0x20;
    pub const TLV_IPV4_SUBNET_MASK: u8 = 0x21;
    /// Packet Service Status indication: connection status
    pub const TLV_CONNECTION_STATUS: u8 = 0x01;

    /// Profile type 3GPP
    pub const PROFILE_TYPE_3GPP: u8 = 0x00;
    /// Connection status values
    pub const STATUS_DISCONNECTED: u8 = 0x01;
    pub const STATUS_CONNECTED: u8 = 0x02;
    /// Requested settings: DNS, IP address, gateway, subnet
    pub const SETTINGS_MASK_IPV4: u32 = 0x0000_0310;
}

/// Result TLV carried by every response
pub const TLV_RESULT: u8 = 0x02;

/// Human readable name of a QMI error code
pub fn error_name(code: u16) -> &'static str {
    match code {
        0x0000 => "None",
        0x0001 => "MalformedMessage",
        0x0002 => "NoMemory",
        0x0003 => "Internal",
        0x0004 => "Aborted",
        0x0005 => "ClientIdsExhausted",
        0x000E => "CallFailed",
        0x0010 => "InvalidProfile",
        0x001A => "NoEffect",
        0x0029 => "InvalidProfileType",
        0x0030 => "InvalidArgument",
        0x0052 => "AccessDenied",
        _ => "Unknown",
    }
}
