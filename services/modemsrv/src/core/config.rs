//! # Configuration Management Module
//!
//! Layered loading with figment:
//!
//! ```text
//! defaults
//!   └── config/modemsrv.toml | config/modemsrv.yaml   (or --config <file>)
//!         └── MODEMSRV_* environment variables (`__` separates nested keys)
//! ```
//!
//! `MODEMSRV_SERVICE__LOG_LEVEL=debug` overrides `service.log_level`.

use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{ModemSrvError, Result};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "MODEMSRV_";
/// Default serial baud rate
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

// ============================================================================
// Configuration Types
// ============================================================================

/// Root configuration of modemsrv
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ModemsrvConfig {
    pub service: ServiceConfig,
    pub modems: Vec<ModemConfig>,
}

/// Service level settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service name, also the log file prefix
    pub name: String,
    /// Console log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Directory for log files
    pub log_dir: PathBuf,
    /// Write the log file as JSON lines
    pub json_logs: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "modemsrv".to_string(),
            log_level: "info".to_string(),
            log_dir: PathBuf::from("logs"),
            json_logs: false,
        }
    }
}

/// Control protocol spoken by a modem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    At,
    Qmi,
    Mbim,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::At => "at",
            ProtocolKind::Qmi => "qmi",
            ProtocolKind::Mbim => "mbim",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device connection of a modem
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    Serial {
        device: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
    Unix {
        path: PathBuf,
    },
    Tcp {
        host: String,
        port: u16,
    },
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

impl fmt::Display for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportConfig::Serial { device, baud_rate } => write!(f, "serial {}@{}", device, baud_rate),
            TransportConfig::Unix { path } => write!(f, "unix {}", path.display()),
            TransportConfig::Tcp { host, port } => write!(f, "tcp {}:{}", host, port),
        }
    }
}

/// QMI client ids allocated to modemsrv
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct QmiClientConfig {
    /// WDS client id used for data contexts
    pub wds_client_id: Option<u8>,
}

/// PDP context type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum PdpType {
    #[default]
    #[serde(rename = "IP", alias = "ip", alias = "ipv4")]
    Ip,
    #[serde(rename = "IPV6", alias = "ipv6")]
    Ipv6,
    #[serde(rename = "IPV4V6", alias = "ipv4v6")]
    Ipv4v6,
}

impl PdpType {
    /// Name used in `AT+CGDCONT`
    pub fn as_str(&self) -> &'static str {
        match self {
            PdpType::Ip => "IP",
            PdpType::Ipv6 => "IPV6",
            PdpType::Ipv4v6 => "IPV4V6",
        }
    }
}

impl fmt::Display for PdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data context managed by modemsrv
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DataContextConfig {
    pub cid: u8,
    pub apn: String,
    #[serde(default)]
    pub pdp_type: PdpType,
    /// Activate at start-up
    #[serde(default)]
    pub auto_activate: bool,
}

/// One modem
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ModemConfig {
    pub name: String,
    pub protocol: ProtocolKind,
    pub transport: TransportConfig,
    /// In-flight table size of keyed protocols
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default)]
    pub qmi: QmiClientConfig,
    #[serde(default)]
    pub data_context: Option<DataContextConfig>,
}

fn default_max_in_flight() -> usize {
    modem_link::DEFAULT_MAX_IN_FLIGHT
}

// ============================================================================
// Loading
// ============================================================================

impl ModemsrvConfig {
    /// Load from `config/modemsrv.{toml,yaml}` (or `path`) and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let figment = Figment::from(Serialized::defaults(ModemsrvConfig::default()));
        let figment = match path {
            Some(path) => figment.merge(file_provider(path)?),
            None => figment
                .merge(Toml::file("config/modemsrv.toml"))
                .merge(Yaml::file("config/modemsrv.yaml")),
        };
        Self::extract(figment)
    }

    /// Load from a single file without environment overrides
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let figment =
            Figment::from(Serialized::defaults(ModemsrvConfig::default())).merge(file_provider(path)?);
        figment
            .extract()
            .map_err(|e| ModemSrvError::config(format!("Failed to load {}: {}", path.display(), e)))
    }

    fn extract(figment: Figment) -> Result<Self> {
        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ModemSrvError::config(format!("Failed to load configuration: {}", e)))
    }

    /// Reject configurations the runtime cannot start
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for modem in &self.modems {
            if modem.name.trim().is_empty() {
                return Err(ModemSrvError::config("modem name must not be empty"));
            }
            if !names.insert(modem.name.as_str()) {
                return Err(ModemSrvError::config(format!(
                    "duplicate modem name '{}'",
                    modem.name
                )));
            }
            modem.validate()?;
        }
        Ok(())
    }

    pub fn modem(&self, name: &str) -> Option<&ModemConfig> {
        self.modems.iter().find(|m| m.name == name)
    }
}

impl ModemConfig {
    fn validate(&self) -> Result<()> {
        let invalid = |msg: String| ModemSrvError::config(format!("modem '{}': {}", self.name, msg));

        if self.max_in_flight == 0 {
            return Err(invalid("max_in_flight must be at least 1".to_string()));
        }
        match &self.transport {
            TransportConfig::Serial { device, baud_rate } => {
                if device.is_empty() {
                    return Err(invalid("serial device must not be empty".to_string()));
                }
                if *baud_rate == 0 {
                    return Err(invalid("baud_rate must not be 0".to_string()));
                }
            },
            TransportConfig::Tcp { host, .. } if host.is_empty() => {
                return Err(invalid("tcp host must not be empty".to_string()));
            },
            _ => {},
        }

        if let Some(context) = &self.data_context {
            if context.cid == 0 {
                return Err(invalid("data_context.cid must be between 1 and 255".to_string()));
            }
            if context.apn.trim().is_empty() {
                return Err(invalid("data_context.apn must not be empty".to_string()));
            }
            match self.protocol {
                ProtocolKind::At => {},
                ProtocolKind::Qmi if self.qmi.wds_client_id.is_none() => {
                    return Err(invalid(
                        "qmi.wds_client_id is required for a data context".to_string(),
                    ));
                },
                ProtocolKind::Qmi => {},
                ProtocolKind::Mbim => {
                    return Err(invalid(format!(
                        "data contexts are not supported over {}",
                        self.protocol
                    )));
                },
            }
        }
        Ok(())
    }
}

fn file_provider(path: &Path) -> Result<Figment> {
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| ModemSrvError::config("Config file must have an extension"))?;

    let figment = match extension {
        "toml" => Figment::new().merge(Toml::file(path)),
        "yaml" | "yml" => Figment::new().merge(Yaml::file(path)),
        "json" => Figment::new().merge(Json::file(path)),
        _ => {
            return Err(ModemSrvError::config(format!(
                "Unsupported config file format: {}",
                extension
            )))
        },
    };
    if !path.exists() {
        return Err(ModemSrvError::config(format!(
            "Config file not found: {}",
            path.display()
        )));
    }
    Ok(figment)
}

// ============================================================================
// Tests
// ============================================================================
