//! MBIM framing and response correlation

use bytes::{BufMut, Bytes, BytesMut};
use modem_link::{
    Decoded, DispatchPolicy, Disposition, LinkError, Protocol, RequestError, RequestResult,
    TransactionId,
};
use uuid::Uuid;

use super::status_name;

/// Fixed message header length
pub const HEADER_LEN: usize = 12;
/// Largest control message accepted
pub const MAX_MESSAGE_LENGTH: usize = 4096;

const FRAGMENT_HEADER_LEN: usize = 8;

/// MBIM message type values
pub mod message_type {
    pub const OPEN: u32 = 0x0000_0001;
    pub const CLOSE: u32 = 0x0000_0002;
    pub const COMMAND: u32 = 0x0000_0003;
    pub const HOST_ERROR: u32 = 0x0000_0004;
    pub const OPEN_DONE: u32 = 0x8000_0001;
    pub const CLOSE_DONE: u32 = 0x8000_0002;
    pub const COMMAND_DONE: u32 = 0x8000_0003;
    pub const FUNCTION_ERROR: u32 = 0x8000_0004;
    pub const INDICATE_STATUS: u32 = 0x8000_0007;
}

/// Query or set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    Query = 0,
    Set = 1,
}

/// Request submitted to an MBIM channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MbimRequest {
    Open { max_control_transfer: u32 },
    Close,
    Command {
        service: Uuid,
        cid: u32,
        command_type: CommandType,
        info: Bytes,
    },
}

impl MbimRequest {
    pub fn query(service: Uuid, cid: u32) -> Self {
        MbimRequest::Command {
            service,
            cid,
            command_type: CommandType::Query,
            info: Bytes::new(),
        }
    }

    pub fn set(service: Uuid, cid: u32, info: impl Into<Bytes>) -> Self {
        MbimRequest::Command {
            service,
            cid,
            command_type: CommandType::Set,
            info: info.into(),
        }
    }
}

/// Message specific part of a device-originated frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MbimBody {
    /// OPEN_DONE / CLOSE_DONE
    Done { status: u32 },
    CommandDone {
        service: Uuid,
        cid: u32,
        status: u32,
        info: Bytes,
    },
    Indication {
        service: Uuid,
        cid: u32,
        info: Bytes,
    },
    /// FUNCTION_ERROR / HOST_ERROR
    Error { code: u32 },
}

/// Decoded MBIM message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MbimFrame {
    pub message_type: u32,
    pub transaction_id: u32,
    pub body: MbimBody,
}

/// Successful MBIM response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MbimResponse {
    pub info: Bytes,
}

/// Notification pattern: a device service, optionally narrowed to one CID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MbimPattern {
    pub service: Uuid,
    pub cid: Option<u32>,
}

impl MbimPattern {
    pub fn service(service: Uuid) -> Self {
        Self { service, cid: None }
    }

    pub fn cid(service: Uuid, cid: u32) -> Self {
        Self {
            service,
            cid: Some(cid),
        }
    }
}

/// MBIM control channel (TRANSACTION_KEYED)
#[derive(Debug, Clone, Default)]
pub struct MbimProtocol;

impl MbimProtocol {
    pub fn new() -> Self {
        Self
    }
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes: [u8; 4] = data.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

fn read_uuid(data: &[u8], offset: usize) -> Option<Uuid> {
    let bytes: [u8; 16] = data.get(offset..offset + 16)?.try_into().ok()?;
    Some(Uuid::from_bytes(bytes))
}

fn read_info(data: &[u8], len_offset: usize) -> Option<Bytes> {
    let len = read_u32(data, len_offset)? as usize;
    let start = len_offset + 4;
    data.get(start..start + len).map(Bytes::copy_from_slice)
}

/// Parse the body of a complete message of `message_type`
fn parse_body(message_type: u32, data: &[u8]) -> Result<MbimBody, String> {
    let short = || format!("truncated message type 0x{:08X}", message_type);
    match message_type {
        message_type::OPEN_DONE | message_type::CLOSE_DONE => Ok(MbimBody::Done {
            status: read_u32(data, HEADER_LEN).ok_or_else(short)?,
        }),
        message_type::FUNCTION_ERROR | message_type::HOST_ERROR => Ok(MbimBody::Error {
            code: read_u32(data, HEADER_LEN).ok_or_else(short)?,
        }),
        message_type::COMMAND_DONE | message_type::INDICATE_STATUS => {
            let total = read_u32(data, HEADER_LEN).ok_or_else(short)?;
            let current = read_u32(data, HEADER_LEN + 4).ok_or_else(short)?;
            if total != 1 || current != 0 {
                return Err(format!("fragment {}/{} not supported", current, total));
            }
            let base = HEADER_LEN + FRAGMENT_HEADER_LEN;
            let service = read_uuid(data, base).ok_or_else(short)?;
            let cid = read_u32(data, base + 16).ok_or_else(short)?;
            if message_type == message_type::COMMAND_DONE {
                Ok(MbimBody::CommandDone {
                    service,
                    cid,
                    status: read_u32(data, base + 20).ok_or_else(short)?,
                    info: read_info(data, base + 24).ok_or_else(short)?,
                })
            } else {
                Ok(MbimBody::Indication {
                    service,
                    cid,
                    info: read_info(data, base + 20).ok_or_else(short)?,
                })
            }
        },
        other => Err(format!("unexpected message type 0x{:08X}", other)),
    }
}

impl Protocol for MbimProtocol {
    type Command = MbimRequest;
    type Frame = MbimFrame;
    type Response = MbimResponse;
    type Pattern = MbimPattern;

    fn name(&self) -> &'static str {
        "MBIM"
    }

    fn policy(&self) -> DispatchPolicy {
        DispatchPolicy::TransactionKeyed
    }

    fn encode(&mut self, request: &MbimRequest, transaction_id: Option<TransactionId>) -> Result<Bytes, LinkError> {
        let tid = transaction_id
            .ok_or_else(|| LinkError::encode("MBIM request without transaction id"))?
            .0;

        let mut body = BytesMut::new();
        let message_type = match request {
            MbimRequest::Open {
                max_control_transfer,
            } => {
                body.put_u32_le(*max_control_transfer);
                message_type::OPEN
            },
            MbimRequest::Close => message_type::CLOSE,
            MbimRequest::Command {
                service,
                cid,
                command_type,
                info,
            } => {
                body.put_u32_le(1);
                body.put_u32_le(0);
                body.put_slice(service.as_bytes());
                body.put_u32_le(*cid);
                body.put_u32_le(*command_type as u32);
                body.put_u32_le(info.len() as u32);
                body.put_slice(info);
                message_type::COMMAND
            },
        };

        let length = HEADER_LEN + body.len();
        if length > MAX_MESSAGE_LENGTH {
            return Err(LinkError::encode(format!(
                "MBIM message too large: {} bytes",
                length
            )));
        }
        let mut buf = BytesMut::with_capacity(length);
        buf.put_u32_le(message_type);
        buf.put_u32_le(length as u32);
        buf.put_u32_le(tid);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    fn decode(&mut self, buf: &[u8]) -> Decoded<MbimFrame> {
        if buf.len() < HEADER_LEN {
            return Decoded::NeedMoreData;
        }
        let (Some(message_type), Some(length), Some(transaction_id)) =
            (read_u32(buf, 0), read_u32(buf, 4), read_u32(buf, 8))
        else {
            return Decoded::NeedMoreData;
        };

        let length = length as usize;
        if !(HEADER_LEN..=MAX_MESSAGE_LENGTH).contains(&length) {
            return Decoded::Invalid {
                skip: 1,
                reason: format!("implausible message length {}", length),
            };
        }
        if buf.len() < length {
            return Decoded::NeedMoreData;
        }

        match parse_body(message_type, &buf[..length]) {
            Ok(body) => Decoded::Frame {
                consumed: length,
                frame: MbimFrame {
                    message_type,
                    transaction_id,
                    body,
                },
            },
            Err(reason) => Decoded::Invalid {
                skip: length,
                reason,
            },
        }
    }

    fn transaction_id(&self, frame: &MbimFrame) -> Option<TransactionId> {
        match frame.body {
            MbimBody::Indication { .. } => None,
            _ => Some(TransactionId(frame.transaction_id)),
        }
    }

    fn classify(&self, request: &MbimRequest, frame: &MbimFrame) -> Disposition {
        let accepted = match (&frame.body, request) {
            (MbimBody::Error { .. }, _) => true,
            (MbimBody::Done { .. }, MbimRequest::Open { .. }) => frame.message_type == message_type::OPEN_DONE,
            (MbimBody::Done { .. }, MbimRequest::Close) => frame.message_type == message_type::CLOSE_DONE,
            (
                MbimBody::CommandDone { service, cid, .. },
                MbimRequest::Command {
                    service: want_service,
                    cid: want_cid,
                    ..
                },
            ) => service == want_service && cid == want_cid,
            _ => false,
        };
        if accepted {
            Disposition::Final
        } else {
            Disposition::Unrelated
        }
    }

    fn complete(&self, _request: &MbimRequest, _intermediates: Vec<MbimFrame>, frame: MbimFrame) -> RequestResult<MbimResponse> {
        match frame.body {
            MbimBody::Done { status: 0 } => Ok(MbimResponse { info: Bytes::new() }),
            MbimBody::CommandDone { status: 0, info, .. } => Ok(MbimResponse { info }),
            MbimBody::Done { status } | MbimBody::CommandDone { status, .. } => {
                Err(RequestError::device(status, status_name(status)))
            },
            MbimBody::Error { code } => {
                tracing::warn!("MBIM function error {} for transaction {}", code, frame.transaction_id);
                Err(RequestError::device(code, "function error"))
            },
            MbimBody::Indication { .. } => Err(RequestError::decode("indication routed as response")),
        }
    }

    fn matches(&self, pattern: &MbimPattern, frame: &MbimFrame) -> bool {
        match &frame.body {
            MbimBody::Indication { service, cid, .. } => {
                *service == pattern.service && pattern.cid.map_or(true, |c| c == *cid)
            },
            _ => false,
        }
    }
}

/// Build a device-originated COMMAND_DONE or INDICATE_STATUS message
#[doc(hidden)]
pub fn encode_device_frame(
    message_type: u32,
    transaction_id: u32,
    service: Uuid,
    cid: u32,
    status: Option<u32>,
    info: &[u8],
) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u32_le(1);
    body.put_u32_le(0);
    body.put_slice(service.as_bytes());
    body.put_u32_le(cid);
    if let Some(status) = status {
        body.put_u32_le(status);
    }
    body.put_u32_le(info.len() as u32);
    body.put_slice(info);

    let mut buf = BytesMut::new();
    buf.put_u32_le(message_type);
    buf.put_u32_le((HEADER_LEN + body.len()) as u32);
    buf.put_u32_le(transaction_id);
    buf.put_slice(&body);
    buf.freeze()
}
