//! Core Modem Service Components
//!
//! - **`config`** - layered configuration loading and validation
//! - **`logging`** - console and rolling file output
//! - **`bootstrap`** - command line, logging and configuration start-up
//! - **`runtime`** - channel tasks and device transports
//! - **`registry`** - per-protocol modem drivers
//! - **`service`** - start-up and shutdown of all modems

pub mod bootstrap;
pub mod config;
pub mod logging;
pub mod registry;
pub mod runtime;
pub mod service;
