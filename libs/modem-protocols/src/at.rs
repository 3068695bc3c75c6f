//! AT Command Protocol
//!
//! Line-oriented chat over a half-duplex serial line. Responses are CR/LF
//! terminated lines ending with a final result code; everything else that
//! does not carry one of the pending command's expected prefixes is an
//! unsolicited result code (URC).
//!
//! ```text
//! at
//!     ├── AtCommand / CommandBuilder (command text, expected prefixes)
//!     ├── AtLine / AtParams          (line access, parameter iterator)
//!     └── AtProtocol                 (framing, final codes, correlation)
//! ```

mod command;
mod line;
mod protocol;

pub use command::{AtCommand, CommandBuilder};
pub use line::{AtLine, AtParams, AtValue};
pub use protocol::{final_result, AtProtocol, AtResponse, FinalResult, MAX_LINE_LENGTH, VERBOSE_ERROR_CODE};
