//! Modem Service Library (modemsrv)
//!
//! Controls cellular modems over AT, QMI or MBIM and brings their packet
//! data contexts up and down.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │   Config        │───►│ Driver Registry │───►│  Channel tasks  │
//! │ (toml/yaml/env) │    │  (AT/QMI/MBIM)  │    │ (one per modem) │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//!                                                        │
//!                                                        ▼
//!                        ┌─────────────────┐    ┌─────────────────┐
//!                        │  ModemEvent     │◄───│  Data context   │
//!                        │  notify hook    │    │  facade         │
//!                        └─────────────────┘    └─────────────────┘
//! ```
//!
//! - **`core`**: configuration, logging, channel runtime, drivers, lifecycle
//! - **`facade`**: data-context activation and the events it publishes
//! - **`error`**: service error type
//!
//! Request correlation lives in `modem_link`; wire codecs in `modem_protocols`.

pub mod core;
pub mod error;
pub mod facade;

pub use crate::core::config::ModemsrvConfig;
pub use crate::core::registry::{DriverRegistry, ModemDriver, ModemInstance};
pub use crate::core::service::{wait_for_shutdown, ModemService};
pub use crate::error::{ModemSrvError, Result};
pub use crate::facade::{DataContextService, GprsError, ModemEvent};
