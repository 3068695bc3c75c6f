//! Service Bootstrap and Initialization
//!
//! This module handles service initialization including:
//! - Command-line arguments
//! - Logging configuration
//! - Configuration loading and validation

use clap::Parser;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::core::config::ModemsrvConfig;
use crate::core::logging::{self, LogConfig};
use crate::error::{ModemSrvError, Result};

/// Command-line arguments for modemsrv
#[derive(Parser, Debug, Clone)]
#[command(
    name = "modemsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Modem Service - AT/QMI/MBIM control and data contexts",
    long_about = None
)]
pub struct Args {
    /// Configuration file (toml, yaml or json)
    #[arg(short = 'c', long, env = "MODEMSRV_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    pub validate: bool,
}

/// Load and validate the configuration named by `args`
pub fn load_configuration(args: &Args) -> Result<ModemsrvConfig> {
    let config = ModemsrvConfig::load(args.config.as_deref())?;
    config.validate()?;
    Ok(config)
}

/// Initialize logging
///
/// The command-line level overrides the configured one; `RUST_LOG`
/// overrides both.
pub fn initialize_logging(args: &Args, config: &ModemsrvConfig) -> Result<()> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(config.service.log_level.as_str());

    let log_config = LogConfig {
        service_name: config.service.name.clone(),
        log_dir: config.service.log_dir.clone(),
        console_level: logging::parse_level(level),
        ansi: !args.no_color,
        enable_json: config.service.json_logs,
    };

    logging::init_with_config(log_config)
        .map_err(|e| ModemSrvError::config(format!("Failed to init logging: {}", e)))
}

/// Log the effective configuration
pub fn validate_configuration(config: &ModemsrvConfig) -> Result<()> {
    debug!("Validating configuration");

    info!("Service: {}", config.service.name);
    info!("Found {} modem(s)", config.modems.len());
    for modem in &config.modems {
        info!(
            "  Modem {}: protocol {} over {}",
            modem.name, modem.protocol, modem.transport
        );
        if let Some(context) = &modem.data_context {
            info!(
                "    Data context cid={} apn={} pdp={} auto_activate={}",
                context.cid, context.apn, context.pdp_type, context.auto_activate
            );
        }
    }

    let rendered = serde_yaml::to_string(config)
        .map_err(|e| ModemSrvError::config(format!("Failed to render configuration: {}", e)))?;
    debug!("Effective configuration:\n{}", rendered);

    info!("Configuration validation completed successfully");
    Ok(())
}
