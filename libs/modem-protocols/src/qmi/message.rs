//! QMI messages and TLVs

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// One type-length-value element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub tlv_type: u8,
    pub value: Bytes,
}

impl Tlv {
    pub fn new(tlv_type: u8, value: impl Into<Bytes>) -> Self {
        Self {
            tlv_type,
            value: value.into(),
        }
    }

    pub fn u8(tlv_type: u8, value: u8) -> Self {
        Self::new(tlv_type, vec![value])
    }

    pub fn u16(tlv_type: u8, value: u16) -> Self {
        Self::new(tlv_type, value.to_le_bytes().to_vec())
    }

    pub fn u32(tlv_type: u8, value: u32) -> Self {
        Self::new(tlv_type, value.to_le_bytes().to_vec())
    }

    pub fn string(tlv_type: u8, value: &str) -> Self {
        Self::new(tlv_type, value.as_bytes().to_vec())
    }

    pub fn as_u8(&self) -> Option<u8> {
        self.value.first().copied()
    }

    pub fn as_u16(&self) -> Option<u16> {
        let bytes: [u8; 2] = self.value.get(..2)?.try_into().ok()?;
        Some(u16::from_le_bytes(bytes))
    }

    pub fn as_u32(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.value.get(..4)?.try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }

    pub fn as_string(&self) -> Option<String> {
        String::from_utf8(self.value.to_vec()).ok()
    }

    pub(crate) fn encoded_len(&self) -> usize {
        3 + self.value.len()
    }

    pub(crate) fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tlv_type);
        buf.put_u16_le(self.value.len() as u16);
        buf.put_slice(&self.value);
    }
}

/// Split a TLV block into elements
pub(crate) fn parse_tlvs(mut data: &[u8]) -> Result<Vec<Tlv>, String> {
    let mut tlvs = Vec::new();
    while !data.is_empty() {
        if data.len() < 3 {
            return Err(format!("truncated TLV header ({} bytes left)", data.len()));
        }
        let tlv_type = data[0];
        let len = usize::from(u16::from_le_bytes([data[1], data[2]]));
        if data.len() < 3 + len {
            return Err(format!(
                "TLV 0x{:02X} declares {} bytes, {} available",
                tlv_type,
                len,
                data.len() - 3
            ));
        }
        tlvs.push(Tlv::new(tlv_type, Bytes::copy_from_slice(&data[3..3 + len])));
        data = &data[3 + len..];
    }
    Ok(tlvs)
}

/// Direction of a QMI message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    Indication,
}

impl MessageKind {
    /// Decode the service header flags
    ///
    /// CTL uses 0/1/2; the other services shift the same values left by one.
    pub(crate) fn from_flags(service: u8, flags: u8) -> Option<Self> {
        let value = if service == super::service::CTL {
            flags
        } else {
            flags >> 1
        };
        match value {
            0 => Some(MessageKind::Request),
            1 => Some(MessageKind::Response),
            2 => Some(MessageKind::Indication),
            _ => None,
        }
    }
}

/// Request submitted to a QMI channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QmiRequest {
    pub service: u8,
    pub client_id: u8,
    pub message_id: u16,
    pub tlvs: Vec<Tlv>,
}

impl QmiRequest {
    pub fn new(service: u8, client_id: u8, message_id: u16) -> Self {
        Self {
            service,
            client_id,
            message_id,
            tlvs: Vec::new(),
        }
    }

    pub fn tlv(mut self, tlv: Tlv) -> Self {
        self.tlvs.push(tlv);
        self
    }
}

/// Decoded QMUX frame
///
/// TLVs stay raw until a response is completed so a malformed payload can
/// still be routed by transaction id.
#[derive(Clone, PartialEq, Eq)]
pub struct QmiFrame {
    pub service: u8,
    pub client_id: u8,
    pub kind: MessageKind,
    pub transaction_id: u16,
    pub message_id: u16,
    pub payload: Bytes,
}

impl QmiFrame {
    pub fn tlvs(&self) -> Result<Vec<Tlv>, String> {
        parse_tlvs(&self.payload)
    }
}

impl fmt::Debug for QmiFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QMI {:?} svc=0x{:02X} cid={} tid={} msg=0x{:04X} payload={}B",
            self.kind,
            self.service,
            self.client_id,
            self.transaction_id,
            self.message_id,
            self.payload.len()
        )
    }
}

/// Successful QMI response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QmiResponse {
    pub message_id: u16,
    pub tlvs: Vec<Tlv>,
}

impl QmiResponse {
    pub fn tlv(&self, tlv_type: u8) -> Option<&Tlv> {
        self.tlvs.iter().find(|t| t.tlv_type == tlv_type)
    }

    pub fn u8(&self, tlv_type: u8) -> Option<u8> {
        self.tlv(tlv_type).and_then(Tlv::as_u8)
    }

    pub fn u16(&self, tlv_type: u8) -> Option<u16> {
        self.tlv(tlv_type).and_then(Tlv::as_u16)
    }

    pub fn u32(&self, tlv_type: u8) -> Option<u32> {
        self.tlv(tlv_type).and_then(Tlv::as_u32)
    }

    pub fn string(&self, tlv_type: u8) -> Option<String> {
        self.tlv(tlv_type).and_then(Tlv::as_string)
    }
}
