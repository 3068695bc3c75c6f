//! Modem Driver Registry
//!
//! Maps every protocol family to the driver that builds a running modem
//! from its configuration: channel task, facades and notification watches.
//!
//! ## Usage
//!
//! Adding a protocol family requires only 2 changes:
//! 1. Implement `ModemDriver` for it
//! 2. Register it in `DriverRegistry::with_defaults()`

use async_trait::async_trait;
use modem_link::{Channel, ChannelStats, Completion, Protocol};
use modem_protocols::at::{AtCommand, AtLine, AtProtocol};
use modem_protocols::mbim::{MbimBody, MbimFrame, MbimPattern, MbimProtocol, MbimRequest, BASIC_CONNECT};
use modem_protocols::qmi::{service, QmiFrame, QmiPattern, QmiProtocol};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::{ModemConfig, ProtocolKind};
use crate::core::runtime::{open_transport, spawn_channel, AsyncIo, ChannelSpec};
use crate::error::{ModemSrvError, Result};
use crate::facade::{
    AtContextDriver, DataContext, DataContextService, ModemEvent, NotifyHook, QmiContextDriver,
};
use crate::facade::service::RemoteDataContext;

/// Largest control message the host accepts from an MBIM function
const MBIM_MAX_CONTROL_TRANSFER: u32 = 4096;

/// Everything a driver needs to bring one modem up
pub struct Launch<'a> {
    pub id: u32,
    pub modem: &'a ModemConfig,
    pub io: Box<dyn AsyncIo>,
    pub notify: NotifyHook,
    pub token: CancellationToken,
}

/// A modem whose channel task is running
pub struct ModemInstance {
    pub name: String,
    pub protocol: ProtocolKind,
    pub data_context: Option<Arc<dyn DataContextService>>,
    pub task: JoinHandle<ChannelStats>,
}

impl fmt::Debug for ModemInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModemInstance")
            .field("name", &self.name)
            .field("protocol", &self.protocol)
            .field("data_context", &self.data_context.is_some())
            .finish()
    }
}

// ============================================================================
// Modem Driver Trait
// ============================================================================

/// Per-family start-up of a modem
#[async_trait]
pub trait ModemDriver: Send + Sync {
    fn protocol(&self) -> ProtocolKind;

    /// Spawn the channel task over an already open connection
    fn launch(&self, launch: Launch<'_>) -> Result<ModemInstance>;

    /// Open the configured transport and launch
    async fn start(
        &self,
        id: u32,
        modem: &ModemConfig,
        notify: NotifyHook,
        token: CancellationToken,
    ) -> Result<ModemInstance> {
        let io = open_transport(&modem.transport).await?;
        info!("Modem {} connected over {}", modem.name, modem.transport);
        self.launch(Launch {
            id,
            modem,
            io,
            notify,
            token,
        })
    }
}

fn spec<P: Protocol>(launch: &Launch<'_>, protocol: P) -> ChannelSpec<P> {
    ChannelSpec {
        id: launch.id,
        name: launch.modem.name.clone(),
        protocol,
        max_in_flight: launch.modem.max_in_flight,
    }
}

/// Submit a set-up request whose outcome is only logged
fn fire<P: Protocol>(channel: &mut Channel<P>, modem: &str, command: P::Command) {
    let label = format!("{:?}", command);
    let name = modem.to_string();
    let completion: Completion<P> = Box::new(move |_, result| match result {
        Ok(_) => debug!(modem = %name, "{} accepted", label),
        Err(e) => warn!(modem = %name, "{} failed: {}", label, e),
    });
    if let Err(e) = channel.submit(command, completion) {
        warn!(modem = %modem, "Set-up request not sent: {}", e);
    }
}

// ============================================================================
// Built-in Drivers
// ============================================================================

/// AT command modems
pub struct AtDriver;

#[async_trait]
impl ModemDriver for AtDriver {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::At
    }

    fn launch(&self, launch: Launch<'_>) -> Result<ModemInstance> {
        let name = launch.modem.name.clone();
        let context = DataContext::new(name.clone(), AtContextDriver::new(), launch.notify.clone());
        let installer = context.clone();
        let notify = launch.notify.clone();
        let modem = name.clone();

        let spec = spec(&launch, AtProtocol::new());
        let (handle, task) = spawn_channel(spec, launch.io, launch.token, move |channel| {
            // Echo off, numeric +CME ERROR codes
            fire(channel, &modem, AtCommand::new("ATE0"));
            fire(channel, &modem, AtCommand::new("AT+CMEE=1"));
            installer.install(channel);
            channel.register(
                "+".to_string(),
                false,
                Box::new(move |_, line: &AtLine| {
                    notify(ModemEvent::Indication {
                        modem: modem.clone(),
                        summary: line.as_str().to_string(),
                    })
                }),
            );
        });

        let data_context: Option<Arc<dyn DataContextService>> = launch
            .modem
            .data_context
            .as_ref()
            .map(|_| Arc::new(RemoteDataContext::new(context, handle)) as Arc<dyn DataContextService>);
        Ok(ModemInstance {
            name,
            protocol: ProtocolKind::At,
            data_context,
            task,
        })
    }
}

/// QMI modems; data contexts use the configured WDS client
pub struct QmiDriver;

#[async_trait]
impl ModemDriver for QmiDriver {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Qmi
    }

    fn launch(&self, launch: Launch<'_>) -> Result<ModemInstance> {
        let name = launch.modem.name.clone();
        let client_id = launch.modem.qmi.wds_client_id;
        let context = match (client_id, &launch.modem.data_context) {
            (Some(client_id), Some(_)) => Some(DataContext::new(
                name.clone(),
                QmiContextDriver::new(client_id),
                launch.notify.clone(),
            )),
            (None, Some(_)) => {
                return Err(ModemSrvError::config(format!(
                    "modem '{}': qmi.wds_client_id is required for a data context",
                    name
                )))
            },
            _ => None,
        };

        let installer = context.clone();
        let notify = launch.notify.clone();
        let modem = name.clone();
        let pattern = match client_id {
            Some(client_id) => QmiPattern::service(service::WDS).for_client(client_id),
            None => QmiPattern::service(service::WDS),
        };

        let spec = spec(&launch, QmiProtocol::new());
        let (handle, task) = spawn_channel(spec, launch.io, launch.token, move |channel| {
            if let Some(context) = installer {
                context.install(channel);
            }
            channel.register(
                pattern,
                false,
                Box::new(move |_, frame: &QmiFrame| {
                    notify(ModemEvent::Indication {
                        modem: modem.clone(),
                        summary: format!(
                            "QMI service 0x{:02X} indication 0x{:04X}",
                            frame.service, frame.message_id
                        ),
                    })
                }),
            );
        });

        let data_context = context
            .map(|context| Arc::new(RemoteDataContext::new(context, handle)) as Arc<dyn DataContextService>);
        Ok(ModemInstance {
            name,
            protocol: ProtocolKind::Qmi,
            data_context,
            task,
        })
    }
}

/// MBIM functions; control channel and Basic Connect indications only
pub struct MbimDriver;

#[async_trait]
impl ModemDriver for MbimDriver {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Mbim
    }

    fn launch(&self, launch: Launch<'_>) -> Result<ModemInstance> {
        if launch.modem.data_context.is_some() {
            return Err(ModemSrvError::UnsupportedProtocol(format!(
                "data contexts over {}",
                ProtocolKind::Mbim
            )));
        }

        let name = launch.modem.name.clone();
        let notify = launch.notify.clone();
        let modem = name.clone();

        let spec = spec(&launch, MbimProtocol::new());
        let (_handle, task) = spawn_channel(spec, launch.io, launch.token, move |channel| {
            fire(
                channel,
                &modem,
                MbimRequest::Open {
                    max_control_transfer: MBIM_MAX_CONTROL_TRANSFER,
                },
            );
            channel.register(
                MbimPattern::service(BASIC_CONNECT),
                false,
                Box::new(move |_, frame: &MbimFrame| {
                    if let MbimBody::Indication { service, cid, .. } = &frame.body {
                        notify(ModemEvent::Indication {
                            modem: modem.clone(),
                            summary: format!("MBIM {} cid {}", service, cid),
                        })
                    }
                }),
            );
        });

        Ok(ModemInstance {
            name,
            protocol: ProtocolKind::Mbim,
            data_context: None,
            task,
        })
    }
}

// ============================================================================
// Driver Registry
// ============================================================================

/// Drivers by protocol family
///
/// Populated once at start-up and read-only afterwards.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: HashMap<ProtocolKind, Arc<dyn ModemDriver>>,
}

impl DriverRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the AT, QMI and MBIM drivers
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(AtDriver));
        registry.register(Arc::new(QmiDriver));
        registry.register(Arc::new(MbimDriver));
        registry
    }

    /// Register a driver, replacing any previous one for its family
    pub fn register(&mut self, driver: Arc<dyn ModemDriver>) {
        self.drivers.insert(driver.protocol(), driver);
    }

    pub fn get(&self, protocol: ProtocolKind) -> Result<Arc<dyn ModemDriver>> {
        self.drivers
            .get(&protocol)
            .cloned()
            .ok_or_else(|| ModemSrvError::UnsupportedProtocol(protocol.to_string()))
    }

    pub fn is_registered(&self, protocol: ProtocolKind) -> bool {
        self.drivers.contains_key(&protocol)
    }

    pub fn registered_protocols(&self) -> Vec<ProtocolKind> {
        self.drivers.keys().copied().collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
