//! Events published by a modem towards the service bus

use serde::Serialize;
use std::sync::Arc;

use super::gprs::ActiveContext;

/// Why a data context went down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeactivationReason {
    /// Deactivated on request of the service
    Local,
    /// Deactivated by the network or the modem itself
    Network,
}

/// Notification delivered to the owning subsystem
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ModemEvent {
    ContextActivated {
        modem: String,
        context: ActiveContext,
    },
    ContextDeactivated {
        modem: String,
        cid: u8,
        reason: DeactivationReason,
    },
    /// Unsolicited indication, summarized
    Indication { modem: String, summary: String },
}

impl ModemEvent {
    pub fn modem(&self) -> &str {
        match self {
            ModemEvent::ContextActivated { modem, .. }
            | ModemEvent::ContextDeactivated { modem, .. }
            | ModemEvent::Indication { modem, .. } => modem,
        }
    }
}

/// Per-modem notification sink supplied by the owner
pub type NotifyHook = Arc<dyn Fn(ModemEvent) + Send + Sync>;

/// Hook writing every event to the log as a JSON object
pub fn log_events() -> NotifyHook {
    Arc::new(|event: ModemEvent| match serde_json::to_string(&event) {
        Ok(json) => tracing::info!(modem = event.modem(), "[EVENT] {}", json),
        Err(e) => tracing::warn!("Failed to serialize {:?}: {}", event, e),
    })
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = ModemEvent::ContextDeactivated {
            modem: "wwan0".to_string(),
            cid: 1,
            reason: DeactivationReason::Network,
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "context_deactivated");
        assert_eq!(json["cid"], 1);
        assert_eq!(json["reason"], "network");
    }

    #[test]
    fn test_indication_modem_name() {
        let event = ModemEvent::Indication {
            modem: "lab".to_string(),
            summary: "+CREG: 1".to_string(),
        };
        assert_eq!(event.modem(), "lab");
    }
}
