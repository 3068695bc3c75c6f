//! Service lifecycle
//!
//! Starts one channel task per configured modem, triggers the configured
//! data-context activations and stops everything on shutdown.

use futures::future::join_all;
use modem_link::ChannelStats;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::config::{ModemConfig, ModemsrvConfig};
use crate::core::registry::{DriverRegistry, ModemInstance};
use crate::error::Result;
use crate::facade::{DataContextRequest, DataContextService, NotifyHook};

/// Running modems of the service
pub struct ModemService {
    token: CancellationToken,
    modems: Vec<ModemInstance>,
}

impl ModemService {
    /// Start every configured modem
    ///
    /// A modem that fails to start is logged and skipped; the others keep
    /// running.
    pub async fn start(config: &ModemsrvConfig, registry: &DriverRegistry, notify: NotifyHook) -> Result<Self> {
        let token = CancellationToken::new();
        if config.modems.is_empty() {
            warn!("No modems configured");
            return Ok(Self {
                token,
                modems: Vec::new(),
            });
        }

        info!("Starting {} modem(s)...", config.modems.len());
        let starts = config.modems.iter().enumerate().map(|(index, modem)| {
            let notify = notify.clone();
            let token = token.child_token();
            async move {
                match registry.get(modem.protocol) {
                    Ok(driver) => driver.start(index as u32 + 1, modem, notify, token).await,
                    Err(e) => Err(e),
                }
            }
        });

        let mut modems = Vec::new();
        for (modem, result) in config.modems.iter().zip(join_all(starts).await) {
            match result {
                Ok(instance) => {
                    info!("Modem {} started ({})", modem.name, modem.protocol);
                    auto_activate(modem, &instance);
                    modems.push(instance);
                },
                Err(e) => error!("Modem {} failed to start: {}", modem.name, e),
            }
        }

        info!(
            "Modem startup completed: {} running, {} failed",
            modems.len(),
            config.modems.len() - modems.len()
        );
        Ok(Self { token, modems })
    }

    pub fn modems(&self) -> &[ModemInstance] {
        &self.modems
    }

    /// Data-context service of the modem `name`, if it has one
    pub fn data_context(&self, name: &str) -> Option<Arc<dyn DataContextService>> {
        self.modems
            .iter()
            .find(|m| m.name == name)
            .and_then(|m| m.data_context.clone())
    }

    /// Token cancelled by `shutdown`
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Close every channel and wait for the channel tasks
    ///
    /// Outstanding requests complete with `ChannelClosed` before this returns.
    pub async fn shutdown(self) -> Vec<(String, ChannelStats)> {
        info!("Starting graceful shutdown...");
        self.token.cancel();

        let (names, tasks): (Vec<String>, Vec<_>) =
            self.modems.into_iter().map(|m| (m.name, m.task)).unzip();
        let results = join_all(tasks).await;

        let mut stopped = Vec::new();
        for (name, result) in names.into_iter().zip(results) {
            match result {
                Ok(stats) => {
                    match serde_json::to_string(&stats) {
                        Ok(json) => info!("Modem {} stopped: {}", name, json),
                        Err(_) => info!("Modem {} stopped: {:?}", name, stats),
                    }
                    stopped.push((name, stats));
                },
                Err(e) => error!("Modem {} channel task failed: {}", name, e),
            }
        }

        info!("Shutdown completed: {} modem(s) stopped", stopped.len());
        stopped
    }
}

fn auto_activate(modem: &ModemConfig, instance: &ModemInstance) {
    let Some(config) = modem.data_context.as_ref().filter(|c| c.auto_activate) else {
        return;
    };
    let Some(service) = instance.data_context.clone() else {
        return;
    };

    let request = DataContextRequest::from(config);
    let name = modem.name.clone();
    tokio::spawn(async move {
        match service.activate_and_wait(request).await {
            Ok(active) => info!(
                "Modem {} context cid={} up: address {:?}, gateway {:?}, dns {:?}",
                name, active.cid, active.settings.address, active.settings.gateway, active.settings.dns
            ),
            Err(e) => warn!("Modem {} auto-activation failed: {}", name, e),
        }
    });
}

/// Wait for Ctrl+C or for `token` to be cancelled
pub async fn wait_for_shutdown(token: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        },
        _ = token.cancelled() => info!("Shutdown requested"),
    }
}
