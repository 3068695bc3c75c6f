//! AT framing and response correlation

use bytes::Bytes;
use modem_link::{
    Decoded, DispatchPolicy, Disposition, LinkError, Protocol, RequestError, RequestResult,
    TransactionId,
};
use tracing::debug;

use super::command::AtCommand;
use super::line::AtLine;

/// Longest line accepted before the buffer is treated as garbage
pub const MAX_LINE_LENGTH: usize = 4096;

/// `DeviceError::code` of a `+CME ERROR` / `+CMS ERROR` reported as text
pub const VERBOSE_ERROR_CODE: u32 = u32::MAX;

/// Final result codes terminating a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalResult {
    Ok,
    Connect,
    Error,
    CmeError(Option<u32>),
    CmsError(Option<u32>),
    NoCarrier,
    Busy,
    NoAnswer,
    NoDialtone,
}

impl FinalResult {
    pub fn is_success(&self) -> bool {
        matches!(self, FinalResult::Ok | FinalResult::Connect)
    }

    /// Code reported as `DeviceError::code`
    ///
    /// `+CME ERROR` / `+CMS ERROR` carry the device's numeric code, or
    /// [`VERBOSE_ERROR_CODE`] in verbose mode; the other failures use their
    /// V.250 numeric result code.
    pub fn device_code(&self) -> Option<u32> {
        match self {
            FinalResult::Ok | FinalResult::Connect => None,
            FinalResult::Error => Some(4),
            FinalResult::NoCarrier => Some(3),
            FinalResult::NoDialtone => Some(6),
            FinalResult::Busy => Some(7),
            FinalResult::NoAnswer => Some(8),
            FinalResult::CmeError(code) | FinalResult::CmsError(code) => {
                Some(code.unwrap_or(VERBOSE_ERROR_CODE))
            },
        }
    }
}

/// Classify `line` as a final result code
pub fn final_result(line: &str) -> Option<FinalResult> {
    match line {
        "OK" => return Some(FinalResult::Ok),
        "ERROR" => return Some(FinalResult::Error),
        "NO CARRIER" => return Some(FinalResult::NoCarrier),
        "BUSY" => return Some(FinalResult::Busy),
        "NO ANSWER" => return Some(FinalResult::NoAnswer),
        "NO DIALTONE" => return Some(FinalResult::NoDialtone),
        _ => {},
    }
    if line == "CONNECT" || line.starts_with("CONNECT ") {
        return Some(FinalResult::Connect);
    }
    if let Some(code) = line.strip_prefix("+CME ERROR:") {
        return Some(FinalResult::CmeError(code.trim().parse().ok()));
    }
    if let Some(code) = line.strip_prefix("+CMS ERROR:") {
        return Some(FinalResult::CmsError(code.trim().parse().ok()));
    }
    None
}

/// Successful response: intermediate lines plus the final code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtResponse {
    pub lines: Vec<AtLine>,
    pub final_line: String,
}

impl AtResponse {
    /// First intermediate line starting with `prefix`
    pub fn line(&self, prefix: &str) -> Option<&AtLine> {
        self.lines.iter().find(|l| l.starts_with(prefix))
    }

    /// All intermediate lines starting with `prefix`
    pub fn lines_with<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a AtLine> + 'a {
        self.lines.iter().filter(move |l| l.starts_with(prefix))
    }
}

/// AT chat protocol (STRICT_FIFO)
#[derive(Debug, Clone)]
pub struct AtProtocol {
    terminator: &'static str,
}

impl AtProtocol {
    pub fn new() -> Self {
        Self { terminator: "\r" }
    }
}

impl Default for AtProtocol {
    fn default() -> Self {
        Self::new()
    }
}

fn is_line_break(b: u8) -> bool {
    b == b'\r' || b == b'\n'
}

impl Protocol for AtProtocol {
    type Command = AtCommand;
    type Frame = AtLine;
    type Response = AtResponse;
    type Pattern = String;

    fn name(&self) -> &'static str {
        "AT"
    }

    fn policy(&self) -> DispatchPolicy {
        DispatchPolicy::StrictFifo
    }

    fn encode(&mut self, command: &AtCommand, _transaction_id: Option<TransactionId>) -> Result<Bytes, LinkError> {
        let text = command.text();
        if text.is_empty() {
            return Err(LinkError::encode("empty AT command"));
        }
        if text.bytes().any(is_line_break) {
            return Err(LinkError::encode(format!(
                "line break inside AT command '{}'",
                text.escape_debug()
            )));
        }
        Ok(Bytes::from(format!("{}{}", text, self.terminator)))
    }

    fn decode(&mut self, buf: &[u8]) -> Decoded<AtLine> {
        let Some(start) = buf.iter().position(|b| !is_line_break(*b)) else {
            return Decoded::NeedMoreData;
        };
        let Some(len) = buf[start..].iter().position(|b| is_line_break(*b)) else {
            if buf.len() > MAX_LINE_LENGTH {
                return Decoded::Invalid {
                    skip: buf.len(),
                    reason: format!("unterminated line longer than {} bytes", MAX_LINE_LENGTH),
                };
            }
            return Decoded::NeedMoreData;
        };

        let end = start + len;
        match std::str::from_utf8(&buf[start..end]) {
            Ok(text) => Decoded::Frame {
                consumed: end + 1,
                frame: AtLine::new(text.trim_end()),
            },
            Err(e) => Decoded::Invalid {
                skip: end + 1,
                reason: format!("non UTF-8 line: {}", e),
            },
        }
    }

    fn classify(&self, command: &AtCommand, line: &AtLine) -> Disposition {
        if final_result(line.as_str()).is_some() {
            Disposition::Final
        } else if line.as_str() == command.text() || command.accepts(line.as_str()) {
            Disposition::Intermediate
        } else {
            Disposition::Unrelated
        }
    }

    fn complete(&self, command: &AtCommand, intermediates: Vec<AtLine>, terminal: AtLine) -> RequestResult<AtResponse> {
        let Some(result) = final_result(terminal.as_str()) else {
            return Err(RequestError::decode(format!(
                "'{}' is not a final result code",
                terminal
            )));
        };

        if result.is_success() {
            let (echoes, lines): (Vec<AtLine>, Vec<AtLine>) = intermediates
                .into_iter()
                .partition(|l| l.as_str() == command.text());
            if !echoes.is_empty() {
                debug!("Dropped echo of {}", command.text());
            }
            return Ok(AtResponse {
                lines,
                final_line: terminal.as_str().to_string(),
            });
        }

        let code = result.device_code().unwrap_or(VERBOSE_ERROR_CODE);
        if code == VERBOSE_ERROR_CODE {
            debug!("{} answered with verbose error '{}'", command.text(), terminal);
        }
        Err(RequestError::device(code, terminal.as_str()))
    }

    fn matches(&self, pattern: &String, line: &AtLine) -> bool {
        line.starts_with(pattern)
    }
}
