//! QMUX framing and response correlation

use bytes::{BufMut, Bytes, BytesMut};
use modem_link::{
    Decoded, DispatchPolicy, Disposition, LinkError, Protocol, RequestError, RequestResult,
    TransactionId,
};

use super::message::{MessageKind, QmiFrame, QmiRequest, QmiResponse, Tlv};
use super::{error_name, service, TLV_RESULT};

/// QMUX interface type marker
const QMUX_MARKER: u8 = 0x01;
/// Control flags of host originated messages
const CONTROL_FLAGS_HOST: u8 = 0x00;
/// Largest QMUX length accepted
pub const MAX_QMUX_LENGTH: usize = 0x4000;
/// Marker + length + control flags + service + client id
const QMUX_HEADER_LEN: usize = 6;

/// Notification pattern: a service, optionally narrowed by message and client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QmiPattern {
    pub service: u8,
    pub message_id: Option<u16>,
    pub client_id: Option<u8>,
}

impl QmiPattern {
    /// Every indication of `service`
    pub fn service(service: u8) -> Self {
        Self {
            service,
            message_id: None,
            client_id: None,
        }
    }

    /// Indications of `service` with `message_id`
    pub fn indication(service: u8, message_id: u16) -> Self {
        Self {
            service,
            message_id: Some(message_id),
            client_id: None,
        }
    }

    pub fn for_client(mut self, client_id: u8) -> Self {
        self.client_id = Some(client_id);
        self
    }
}

/// QMI over QMUX (TRANSACTION_KEYED)
///
/// Transaction ids are limited to 1..=255 so a single id space serves both
/// the 8-bit CTL header and the 16-bit service header.
#[derive(Debug, Clone, Default)]
pub struct QmiProtocol;

impl QmiProtocol {
    pub fn new() -> Self {
        Self
    }

    fn service_header_len(service: u8) -> usize {
        if service == service::CTL {
            2
        } else {
            3
        }
    }

    fn parse_frame(data: &[u8]) -> Result<QmiFrame, String> {
        let service = data[4];
        let client_id = data[5];
        let sdu = &data[QMUX_HEADER_LEN..];
        let header_len = Self::service_header_len(service);
        if sdu.len() < header_len + 4 {
            return Err(format!("SDU too short: {} bytes", sdu.len()));
        }

        let kind = MessageKind::from_flags(service, sdu[0])
            .ok_or_else(|| format!("unknown service flags 0x{:02X}", sdu[0]))?;
        let transaction_id = if service == service::CTL {
            u16::from(sdu[1])
        } else {
            u16::from_le_bytes([sdu[1], sdu[2]])
        };
        let message = &sdu[header_len..];
        let message_id = u16::from_le_bytes([message[0], message[1]]);
        let tlv_len = usize::from(u16::from_le_bytes([message[2], message[3]]));
        let payload = &message[4..];
        if payload.len() < tlv_len {
            return Err(format!(
                "TLV block declares {} bytes, {} available",
                tlv_len,
                payload.len()
            ));
        }

        Ok(QmiFrame {
            service,
            client_id,
            kind,
            transaction_id,
            message_id,
            payload: Bytes::copy_from_slice(&payload[..tlv_len]),
        })
    }
}

impl Protocol for QmiProtocol {
    type Command = QmiRequest;
    type Frame = QmiFrame;
    type Response = QmiResponse;
    type Pattern = QmiPattern;

    fn name(&self) -> &'static str {
        "QMI"
    }

    fn policy(&self) -> DispatchPolicy {
        DispatchPolicy::TransactionKeyed
    }

    fn max_transaction_id(&self) -> u32 {
        u32::from(u8::MAX)
    }

    fn encode(&mut self, request: &QmiRequest, transaction_id: Option<TransactionId>) -> Result<Bytes, LinkError> {
        let tid = transaction_id.ok_or_else(|| LinkError::encode("QMI request without transaction id"))?;
        let tid = u8::try_from(tid.0)
            .map_err(|_| LinkError::encode(format!("transaction id {} out of range", tid.0)))?;

        let tlv_len: usize = request.tlvs.iter().map(Tlv::encoded_len).sum();
        let sdu_len = Self::service_header_len(request.service) + 4 + tlv_len;
        let qmux_len = QMUX_HEADER_LEN - 1 + sdu_len;
        if qmux_len > MAX_QMUX_LENGTH {
            return Err(LinkError::encode(format!(
                "QMI message too large: {} bytes",
                qmux_len
            )));
        }

        let mut buf = BytesMut::with_capacity(qmux_len + 1);
        buf.put_u8(QMUX_MARKER);
        buf.put_u16_le(qmux_len as u16);
        buf.put_u8(CONTROL_FLAGS_HOST);
        buf.put_u8(request.service);
        buf.put_u8(request.client_id);
        buf.put_u8(0x00);
        if request.service == service::CTL {
            buf.put_u8(tid);
        } else {
            buf.put_u16_le(u16::from(tid));
        }
        buf.put_u16_le(request.message_id);
        buf.put_u16_le(tlv_len as u16);
        for tlv in &request.tlvs {
            tlv.write_to(&mut buf);
        }
        Ok(buf.freeze())
    }

    fn decode(&mut self, buf: &[u8]) -> Decoded<QmiFrame> {
        let Some(&first) = buf.first() else {
            return Decoded::NeedMoreData;
        };
        if first != QMUX_MARKER {
            let skip = buf.iter().position(|b| *b == QMUX_MARKER).unwrap_or(buf.len());
            return Decoded::Invalid {
                skip,
                reason: format!("expected QMUX marker, got 0x{:02X}", first),
            };
        }
        if buf.len() < 3 {
            return Decoded::NeedMoreData;
        }

        let qmux_len = usize::from(u16::from_le_bytes([buf[1], buf[2]]));
        if !(QMUX_HEADER_LEN - 1 + 2 + 4..=MAX_QMUX_LENGTH).contains(&qmux_len) {
            return Decoded::Invalid {
                skip: 1,
                reason: format!("implausible QMUX length {}", qmux_len),
            };
        }
        let total = qmux_len + 1;
        if buf.len() < total {
            return Decoded::NeedMoreData;
        }

        match Self::parse_frame(&buf[..total]) {
            Ok(frame) => Decoded::Frame {
                consumed: total,
                frame,
            },
            Err(reason) => Decoded::Invalid {
                skip: total,
                reason,
            },
        }
    }

    fn transaction_id(&self, frame: &QmiFrame) -> Option<TransactionId> {
        (frame.kind == MessageKind::Response).then(|| TransactionId(u32::from(frame.transaction_id)))
    }

    fn classify(&self, request: &QmiRequest, frame: &QmiFrame) -> Disposition {
        if frame.kind == MessageKind::Response
            && frame.service == request.service
            && frame.message_id == request.message_id
            && (request.service == service::CTL || frame.client_id == request.client_id)
        {
            Disposition::Final
        } else {
            Disposition::Unrelated
        }
    }

    fn complete(&self, _request: &QmiRequest, _intermediates: Vec<QmiFrame>, frame: QmiFrame) -> RequestResult<QmiResponse> {
        let tlvs = frame.tlvs().map_err(RequestError::decode)?;
        let result = tlvs
            .iter()
            .find(|t| t.tlv_type == TLV_RESULT)
            .ok_or_else(|| RequestError::decode("response without result TLV"))?;
        let (Some(status), Some(error)) = (
            result.as_u16(),
            result.value.get(2..4).map(|b| u16::from_le_bytes([b[0], b[1]])),
        ) else {
            return Err(RequestError::decode(format!(
                "result TLV has {} bytes, expected 4",
                result.value.len()
            )));
        };

        if status != 0 {
            tracing::debug!(
                "QMI message 0x{:04X} failed: {} ({})",
                frame.message_id,
                error,
                error_name(error)
            );
            return Err(RequestError::device(u32::from(error), error_name(error)));
        }
        Ok(QmiResponse {
            message_id: frame.message_id,
            tlvs,
        })
    }

    fn matches(&self, pattern: &QmiPattern, frame: &QmiFrame) -> bool {
        frame.kind == MessageKind::Indication
            && frame.service == pattern.service
            && pattern.message_id.map_or(true, |id| id == frame.message_id)
            && pattern.client_id.map_or(true, |cid| cid == frame.client_id || frame.client_id == 0xFF)
    }
}

/// Build a service-originated frame; used by fake modems in tests
#[doc(hidden)]
pub fn encode_service_frame(
    service: u8,
    client_id: u8,
    kind: MessageKind,
    transaction_id: u16,
    message_id: u16,
    tlvs: &[Tlv],
) -> Bytes {
    let tlv_len: usize = tlvs.iter().map(Tlv::encoded_len).sum();
    let ctl = service == service::CTL;
    let sdu_len = (if ctl { 2 } else { 3 }) + 4 + tlv_len;
    let flags = match (kind, ctl) {
        (MessageKind::Request, _) => 0x00,
        (MessageKind::Response, true) => 0x01,
        (MessageKind::Indication, true) => 0x02,
        (MessageKind::Response, false) => 0x02,
        (MessageKind::Indication, false) => 0x04,
    };

    let mut buf = BytesMut::new();
    buf.put_u8(QMUX_MARKER);
    buf.put_u16_le((QMUX_HEADER_LEN - 1 + sdu_len) as u16);
    buf.put_u8(0x80);
    buf.put_u8(service);
    buf.put_u8(client_id);
    buf.put_u8(flags);
    if ctl {
        buf.put_u8(transaction_id as u8);
    } else {
        buf.put_u16_le(transaction_id);
    }
    buf.put_u16_le(message_id);
    buf.put_u16_le(tlv_len as u16);
    for tlv in tlvs {
        tlv.write_to(&mut buf);
    }
    buf.freeze()
}

/// Result TLV with `status` / `error`
#[doc(hidden)]
pub fn result_tlv(status: u16, error: u16) -> Tlv {
    let mut value = status.to_le_bytes().to_vec();
    value.extend_from_slice(&error.to_le_bytes());
    Tlv::new(TLV_RESULT, value)
}
