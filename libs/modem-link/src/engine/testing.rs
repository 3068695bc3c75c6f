//! In-crate test protocols and transports

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::Channel;
use crate::error::{LinkError, RequestError, RequestResult};
use crate::traits::{
    ChannelLogger, Decoded, DispatchPolicy, Disposition, Protocol, TransactionId, Transport,
    TransportError,
};

/// Shared log of strings pushed from callbacks
#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock())
    }
}

/// Transport recording every write
#[derive(Clone, Default)]
pub struct MockTransport {
    pub writes: Arc<Mutex<Vec<Vec<u8>>>>,
    pub reject: Arc<AtomicBool>,
}

impl MockTransport {
    pub fn written(&self) -> Vec<String> {
        self.writes
            .lock()
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }
}

impl Transport for MockTransport {
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        self.writes.lock().push(data.to_vec());
        Ok(())
    }
}

fn split_line(buf: &[u8]) -> Option<(usize, String)> {
    let end = buf.iter().position(|b| *b == b'\n')?;
    Some((end + 1, String::from_utf8_lossy(&buf[..end]).into_owned()))
}

// ============================================================================
// Line protocol (STRICT_FIFO)
// ============================================================================

/// Command of the line protocol
#[derive(Debug, Clone)]
pub struct LineCommand {
    pub text: String,
    pub prefix: Option<String>,
}

pub fn cmd(text: &str, prefix: Option<&str>) -> LineCommand {
    LineCommand {
        text: text.to_string(),
        prefix: prefix.map(str::to_string),
    }
}

/// Half-duplex text protocol: `OK`, `ERROR` and `ERR <n>` terminate a
/// response, lines with the command prefix are intermediate.
pub struct LineProtocol;

impl Protocol for LineProtocol {
    type Command = LineCommand;
    type Frame = String;
    type Response = Vec<String>;
    type Pattern = String;

    fn name(&self) -> &'static str {
        "line"
    }

    fn policy(&self) -> DispatchPolicy {
        DispatchPolicy::StrictFifo
    }

    fn encode(&mut self, command: &LineCommand, _tid: Option<TransactionId>) -> Result<Bytes, LinkError> {
        if command.text.is_empty() {
            return Err(LinkError::encode("empty command"));
        }
        Ok(Bytes::from(format!("{}\n", command.text)))
    }

    fn decode(&mut self, buf: &[u8]) -> Decoded<String> {
        if buf.first() == Some(&0xFF) {
            return Decoded::Invalid {
                skip: 1,
                reason: "garbage byte".to_string(),
            };
        }
        match split_line(buf) {
            Some((consumed, frame)) => Decoded::Frame { consumed, frame },
            None => Decoded::NeedMoreData,
        }
    }

    fn classify(&self, command: &LineCommand, frame: &String) -> Disposition {
        if frame == "OK" || frame == "ERROR" || frame.starts_with("ERR ") {
            Disposition::Final
        } else if command.prefix.as_ref().is_some_and(|p| frame.starts_with(p.as_str())) {
            Disposition::Intermediate
        } else {
            Disposition::Unrelated
        }
    }

    fn complete(
        &self,
        _command: &LineCommand,
        intermediates: Vec<String>,
        terminal: String,
    ) -> RequestResult<Vec<String>> {
        if terminal == "OK" {
            return Ok(intermediates);
        }
        if terminal == "ERROR" {
            return Err(RequestError::device(0, "ERROR"));
        }
        let code = terminal.trim_start_matches("ERR ");
        code.parse::<u32>()
            .map(|code| Err(RequestError::device(code, terminal.clone())))
            .unwrap_or_else(|_| Err(RequestError::decode(format!("bad error code '{}'", code))))
    }

    fn matches(&self, pattern: &String, frame: &String) -> bool {
        frame.starts_with(pattern.as_str())
    }
}

pub fn line_channel() -> (Channel<LineProtocol>, MockTransport) {
    let transport = MockTransport::default();
    let channel = Channel::new(
        LineProtocol,
        Box::new(transport.clone()),
        ChannelLogger::new(1, "line-test"),
    );
    (channel, transport)
}

// ============================================================================
// Keyed protocol (TRANSACTION_KEYED)
// ============================================================================

/// Text protocol with transaction ids: requests are `<tid> <text>`,
/// responses `<tid> <payload>`, indications `! <payload>`.
pub struct KeyedProtocol {
    pub max_tid: u32,
}

impl Protocol for KeyedProtocol {
    type Command = String;
    type Frame = String;
    type Response = String;
    type Pattern = String;

    fn name(&self) -> &'static str {
        "keyed"
    }

    fn policy(&self) -> DispatchPolicy {
        DispatchPolicy::TransactionKeyed
    }

    fn max_transaction_id(&self) -> u32 {
        self.max_tid
    }

    fn encode(&mut self, command: &String, tid: Option<TransactionId>) -> Result<Bytes, LinkError> {
        let tid = tid.ok_or_else(|| LinkError::encode("missing transaction id"))?;
        Ok(Bytes::from(format!("{} {}\n", tid.0, command)))
    }

    fn decode(&mut self, buf: &[u8]) -> Decoded<String> {
        match split_line(buf) {
            Some((consumed, frame)) => Decoded::Frame { consumed, frame },
            None => Decoded::NeedMoreData,
        }
    }

    fn transaction_id(&self, frame: &String) -> Option<TransactionId> {
        frame
            .split_once(' ')
            .and_then(|(tid, _)| tid.parse::<u32>().ok())
            .map(TransactionId)
    }

    fn classify(&self, _command: &String, _frame: &String) -> Disposition {
        Disposition::Final
    }

    fn complete(&self, _command: &String, _intermediates: Vec<String>, terminal: String) -> RequestResult<String> {
        let payload = terminal.split_once(' ').map(|(_, p)| p).unwrap_or_default();
        if payload == "fail" {
            Err(RequestError::device(1, "fail"))
        } else {
            Ok(payload.to_string())
        }
    }

    fn matches(&self, pattern: &String, frame: &String) -> bool {
        frame.starts_with(pattern.as_str())
    }
}

pub fn keyed_channel(max_tid: u32) -> (Channel<KeyedProtocol>, MockTransport) {
    let transport = MockTransport::default();
    let channel = Channel::new(
        KeyedProtocol { max_tid },
        Box::new(transport.clone()),
        ChannelLogger::new(2, "keyed-test"),
    );
    (channel, transport)
}
