//! Data-context activation facade
//!
//! Composes the primitive requests of a protocol family into one activation:
//!
//! ```text
//! INIT ──define──► DEFINED ──activate──► ACTIVATED ──fetch settings──► DONE
//!  │                  │                      │
//!  ▼                  ▼                      ▼
//! FAILED          FAILED + undefine      FAILED + deactivate
//! ```
//!
//! Every entry point runs on the task owning the channel and answers through
//! exactly one callback. A standing watch on the channel clears the active
//! context when the network tears it down.

mod at;
mod qmi;

pub use at::AtContextDriver;
pub use qmi::QmiContextDriver;

use modem_link::{
    Channel, Completion, LinkError, Protocol, RegistrationId, RequestError, RequestHandle,
    RequestResult,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::events::{DeactivationReason, ModemEvent, NotifyHook};
use crate::core::config::{DataContextConfig, PdpType};

// ============================================================================
// Request and Result Types
// ============================================================================

/// Context to activate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataContextRequest {
    pub cid: u8,
    pub apn: String,
    pub pdp_type: PdpType,
}

impl DataContextRequest {
    pub fn new(cid: u8, apn: impl Into<String>) -> Self {
        Self {
            cid,
            apn: apn.into(),
            pdp_type: PdpType::default(),
        }
    }

    pub fn with_pdp_type(mut self, pdp_type: PdpType) -> Self {
        self.pdp_type = pdp_type;
        self
    }

    fn validate(&self) -> Result<(), GprsError> {
        if self.cid == 0 {
            return Err(GprsError::InvalidRequest("cid 0 is reserved".to_string()));
        }
        if self.apn.trim().is_empty() {
            return Err(GprsError::InvalidRequest("empty APN".to_string()));
        }
        Ok(())
    }
}

impl From<&DataContextConfig> for DataContextRequest {
    fn from(config: &DataContextConfig) -> Self {
        Self::new(config.cid, config.apn.clone()).with_pdp_type(config.pdp_type)
    }
}

/// IP settings of an active context
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContextSettings {
    pub address: Option<IpAddr>,
    pub netmask: Option<IpAddr>,
    pub gateway: Option<IpAddr>,
    pub dns: Vec<IpAddr>,
}

/// Cached marker of the context activated through this facade
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveContext {
    pub cid: u8,
    pub apn: String,
    pub pdp_type: PdpType,
    /// Handle needed to stop the session (QMI packet data handle)
    pub packet_data_handle: Option<u32>,
    pub settings: ContextSettings,
}

impl ActiveContext {
    fn from_request(request: &DataContextRequest, packet_data_handle: Option<u32>) -> Self {
        Self {
            cid: request.cid,
            apn: request.apn.clone(),
            pdp_type: request.pdp_type,
            packet_data_handle,
            settings: ContextSettings::default(),
        }
    }
}

/// Progress of an activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActivationState {
    Init,
    Defined,
    Activated,
    Done,
    Failed,
}

impl fmt::Display for ActivationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivationState::Init => write!(f, "INIT"),
            ActivationState::Defined => write!(f, "DEFINED"),
            ActivationState::Activated => write!(f, "ACTIVATED"),
            ActivationState::Done => write!(f, "DONE"),
            ActivationState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Primitive request issued by the facade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Define,
    Activate,
    FetchSettings,
    Deactivate,
    Undefine,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Define => write!(f, "define"),
            Step::Activate => write!(f, "activate"),
            Step::FetchSettings => write!(f, "fetch settings"),
            Step::Deactivate => write!(f, "deactivate"),
            Step::Undefine => write!(f, "undefine"),
        }
    }
}

/// Data-context facade errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GprsError {
    /// Another activation or deactivation is running
    #[error("Another data context operation is in progress")]
    Busy,

    #[error("Context {0} is already active")]
    AlreadyActive(u8),

    #[error("Context {0} is not active")]
    NotActive(u8),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Operation cancelled")]
    Cancelled,

    /// The channel closed before the operation finished
    #[error("Channel closed")]
    ChannelClosed,

    /// A step was answered with an error
    #[error("{step} failed: {error}")]
    StepFailed { step: Step, error: RequestError },

    /// A step was refused by the channel
    #[error("Request rejected: {0}")]
    Link(LinkError),
}

impl From<LinkError> for GprsError {
    fn from(error: LinkError) -> Self {
        match error {
            LinkError::ChannelClosed => GprsError::ChannelClosed,
            error => GprsError::Link(error),
        }
    }
}

impl GprsError {
    /// Map the outcome of a failed step
    pub fn step(step: Step, error: RequestError) -> Self {
        match error {
            RequestError::Cancelled => GprsError::Cancelled,
            RequestError::ChannelClosed => GprsError::ChannelClosed,
            error => GprsError::StepFailed { step, error },
        }
    }
}

/// Answer to `activate`
pub type ActivateCallback = Box<dyn FnOnce(Result<ActiveContext, GprsError>) + Send>;
/// Answer to `deactivate`
pub type DeactivateCallback = Box<dyn FnOnce(Result<(), GprsError>) + Send>;

// ============================================================================
// Context Driver
// ============================================================================

type CommandOf<D> = <<D as ContextDriver>::Protocol as Protocol>::Command;
type ResponseOf<D> = <<D as ContextDriver>::Protocol as Protocol>::Response;
type FrameOf<D> = <<D as ContextDriver>::Protocol as Protocol>::Frame;
type PatternOf<D> = <<D as ContextDriver>::Protocol as Protocol>::Pattern;

/// Primitive requests of one protocol family
///
/// The facade owns sequencing and compensation; a driver only builds
/// commands and reads responses.
pub trait ContextDriver: Send + Sync + 'static {
    type Protocol: Protocol;

    /// Store the context definition (APN, PDP type) on the device
    fn define(&self, request: &DataContextRequest) -> CommandOf<Self>;

    /// Remove the context definition
    fn undefine(&self, request: &DataContextRequest) -> CommandOf<Self>;

    /// Bring the context up
    fn activate(&self, request: &DataContextRequest) -> CommandOf<Self>;

    /// Session handle carried by the activate response, if the family has one
    fn packet_data_handle(&self, _response: &ResponseOf<Self>) -> Result<Option<u32>, String> {
        Ok(None)
    }

    /// Query address, gateway and DNS of the active context
    fn fetch_settings(&self, request: &DataContextRequest) -> CommandOf<Self>;

    fn parse_settings(
        &self,
        request: &DataContextRequest,
        response: &ResponseOf<Self>,
    ) -> Result<ContextSettings, String>;

    /// Bring the context down; `None` if there is nothing the device could stop
    fn deactivate(&self, context: &ActiveContext) -> Option<CommandOf<Self>>;

    /// Notifications that may announce a network-initiated deactivation
    fn revocation_pattern(&self) -> PatternOf<Self>;

    /// Check whether `frame` tears `context` down
    fn is_revocation(&self, frame: &FrameOf<Self>, context: &ActiveContext) -> bool;
}

// ============================================================================
// Data Context Facade
// ============================================================================

struct Operation {
    id: u64,
    request: DataContextRequest,
    state: ActivationState,
    step: Step,
    pending: Option<RequestHandle>,
    packet_data_handle: Option<u32>,
    callback: ActivateCallback,
}

struct Deactivation {
    cid: u8,
    callback: DeactivateCallback,
}

#[derive(Default)]
struct ContextState {
    next_operation: u64,
    operation: Option<Operation>,
    deactivation: Option<Deactivation>,
    active: Option<ActiveContext>,
    last_outcome: Option<ActivationState>,
    watch: Option<RegistrationId>,
}

/// Data-context facade of one modem
///
/// Cloning is cheap; clones share state. Methods taking a channel must be
/// called on the task owning that channel; the accessors may be called from
/// anywhere.
pub struct DataContext<D: ContextDriver> {
    modem: String,
    driver: Arc<D>,
    shared: Arc<Mutex<ContextState>>,
    notify: NotifyHook,
}

impl<D: ContextDriver> Clone for DataContext<D> {
    fn clone(&self) -> Self {
        Self {
            modem: self.modem.clone(),
            driver: Arc::clone(&self.driver),
            shared: Arc::clone(&self.shared),
            notify: Arc::clone(&self.notify),
        }
    }
}

impl<D: ContextDriver> DataContext<D> {
    pub fn new(modem: impl Into<String>, driver: D, notify: NotifyHook) -> Self {
        Self {
            modem: modem.into(),
            driver: Arc::new(driver),
            shared: Arc::new(Mutex::new(ContextState::default())),
            notify,
        }
    }

    pub fn modem(&self) -> &str {
        &self.modem
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Install the revocation watch on `channel`
    ///
    /// Called once, right after the channel is created.
    pub fn install(&self, channel: &mut Channel<D::Protocol>) {
        let context = self.clone();
        let id = channel.register(
            self.driver.revocation_pattern(),
            false,
            Box::new(move |_, frame| context.on_revocation(frame)),
        );
        debug!(modem = %self.modem, "Revocation watch installed ({})", id);
        self.shared.lock().watch = Some(id);
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Snapshot of the active context
    pub fn active_context(&self) -> Option<ActiveContext> {
        self.shared.lock().active.clone()
    }

    /// State of the running activation
    pub fn activation_state(&self) -> Option<ActivationState> {
        self.shared.lock().operation.as_ref().map(|op| op.state)
    }

    /// DONE or FAILED of the last finished activation
    pub fn last_outcome(&self) -> Option<ActivationState> {
        self.shared.lock().last_outcome
    }

    pub fn is_busy(&self) -> bool {
        let state = self.shared.lock();
        state.operation.is_some() || state.deactivation.is_some()
    }

    // ========================================================================
    // Activation
    // ========================================================================

    /// Define, activate and read the settings of a context
    pub fn activate(
        &self,
        channel: &mut Channel<D::Protocol>,
        request: DataContextRequest,
        callback: ActivateCallback,
    ) {
        if let Err(e) = request.validate() {
            callback(Err(e));
            return;
        }

        let id = {
            let mut state = self.shared.lock();
            if state.operation.is_some() || state.deactivation.is_some() {
                drop(state);
                callback(Err(GprsError::Busy));
                return;
            }
            if let Some(cid) = state.active.as_ref().map(|active| active.cid) {
                drop(state);
                callback(Err(GprsError::AlreadyActive(cid)));
                return;
            }
            state.next_operation += 1;
            let id = state.next_operation;
            state.operation = Some(Operation {
                id,
                request: request.clone(),
                state: ActivationState::Init,
                step: Step::Define,
                pending: None,
                packet_data_handle: None,
                callback,
            });
            id
        };

        info!(
            modem = %self.modem,
            "Activating context cid={} apn={} pdp={}",
            request.cid, request.apn, request.pdp_type
        );
        let command = self.driver.define(&request);
        self.submit_step(channel, id, Step::Define, command);
    }

    /// Abort the running activation
    ///
    /// The callback fires with `Cancelled` before this returns. Returns
    /// `false` if no activation is running.
    pub fn cancel_activation(&self, channel: &mut Channel<D::Protocol>) -> bool {
        let Some(op) = self.shared.lock().operation.take() else {
            return false;
        };
        info!(
            modem = %self.modem,
            "Cancelling activation of cid={} in {}",
            op.request.cid, op.state
        );

        // The step's late answer is discarded by the channel
        if let Some(handle) = op.pending {
            channel.cancel(handle);
        }
        self.compensate(channel, &op, true);
        self.shared.lock().last_outcome = Some(ActivationState::Failed);
        (op.callback)(Err(GprsError::Cancelled));
        true
    }

    fn submit_step(&self, channel: &mut Channel<D::Protocol>, id: u64, step: Step, command: CommandOf<D>) {
        let context = self.clone();
        let submitted = channel.submit(
            command,
            Box::new(move |channel, result| context.on_step_done(channel, id, step, result)),
        );
        match submitted {
            Ok(handle) => {
                let mut state = self.shared.lock();
                if let Some(op) = state.operation.as_mut() {
                    if op.id == id && op.step == step && op.pending.is_none() {
                        op.pending = Some(handle);
                    }
                }
            },
            Err(e) => self.fail(channel, id, e.into()),
        }
    }

    fn on_step_done(
        &self,
        channel: &mut Channel<D::Protocol>,
        id: u64,
        step: Step,
        result: RequestResult<ResponseOf<D>>,
    ) {
        let request = {
            let mut state = self.shared.lock();
            match state.operation.as_mut() {
                Some(op) if op.id == id && op.step == step => {
                    op.pending = None;
                    op.request.clone()
                },
                _ => {
                    debug!(modem = %self.modem, "Ignoring {} outcome of a finished activation", step);
                    return;
                },
            }
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.fail(channel, id, GprsError::step(step, e));
                return;
            },
        };

        match step {
            Step::Define => {
                self.advance(id, ActivationState::Defined, Step::Activate, None);
                let command = self.driver.activate(&request);
                self.submit_step(channel, id, Step::Activate, command);
            },
            Step::Activate => match self.driver.packet_data_handle(&response) {
                Ok(handle) => {
                    self.advance(id, ActivationState::Activated, Step::FetchSettings, handle);
                    let command = self.driver.fetch_settings(&request);
                    self.submit_step(channel, id, Step::FetchSettings, command);
                },
                Err(reason) => {
                    self.fail(channel, id, GprsError::step(step, RequestError::decode(reason)));
                },
            },
            Step::FetchSettings => match self.driver.parse_settings(&request, &response) {
                Ok(settings) => self.finish(id, settings),
                Err(reason) => {
                    self.fail(channel, id, GprsError::step(step, RequestError::decode(reason)));
                },
            },
            Step::Deactivate | Step::Undefine => {},
        }
    }

    fn advance(&self, id: u64, new_state: ActivationState, next: Step, handle: Option<u32>) {
        let mut state = self.shared.lock();
        if let Some(op) = state.operation.as_mut().filter(|op| op.id == id) {
            debug!(
                modem = %self.modem,
                "Context cid={} {} -> {}",
                op.request.cid, op.state, new_state
            );
            op.state = new_state;
            op.step = next;
            if handle.is_some() {
                op.packet_data_handle = handle;
            }
        }
    }

    fn take_operation(&self, id: u64, outcome: ActivationState) -> Option<Operation> {
        let mut state = self.shared.lock();
        if state.operation.as_ref().map(|op| op.id) != Some(id) {
            return None;
        }
        state.last_outcome = Some(outcome);
        state.operation.take()
    }

    fn finish(&self, id: u64, settings: ContextSettings) {
        let Some(op) = self.take_operation(id, ActivationState::Done) else {
            return;
        };
        let mut active = ActiveContext::from_request(&op.request, op.packet_data_handle);
        active.settings = settings;
        self.shared.lock().active = Some(active.clone());

        info!(
            modem = %self.modem,
            "Context cid={} active, address {:?}",
            active.cid, active.settings.address
        );
        (op.callback)(Ok(active.clone()));
        (self.notify)(ModemEvent::ContextActivated {
            modem: self.modem.clone(),
            context: active,
        });
    }

    fn fail(&self, channel: &mut Channel<D::Protocol>, id: u64, error: GprsError) {
        let Some(op) = self.take_operation(id, ActivationState::Failed) else {
            return;
        };
        warn!(
            modem = %self.modem,
            "Activation of cid={} failed in {}: {}",
            op.request.cid, op.state, error
        );
        self.compensate(channel, &op, false);
        (op.callback)(Err(error));
    }

    /// Undo what the steps answered so far may have changed on the device
    ///
    /// A cancelled step may still take effect, so cancellation also undoes
    /// the step that was in flight.
    fn compensate(&self, channel: &mut Channel<D::Protocol>, op: &Operation, cancelled: bool) {
        let context = ActiveContext::from_request(&op.request, op.packet_data_handle);
        let mut steps = Vec::new();
        match op.state {
            ActivationState::Init if cancelled => {
                steps.push((Step::Undefine, self.driver.undefine(&op.request)));
            },
            ActivationState::Defined => {
                if cancelled {
                    if let Some(command) = self.driver.deactivate(&context) {
                        steps.push((Step::Deactivate, command));
                    }
                }
                steps.push((Step::Undefine, self.driver.undefine(&op.request)));
            },
            ActivationState::Activated => {
                if let Some(command) = self.driver.deactivate(&context) {
                    steps.push((Step::Deactivate, command));
                }
            },
            _ => {},
        }

        for (step, command) in steps {
            self.fire_and_forget(channel, step, command);
        }
    }

    fn fire_and_forget(&self, channel: &mut Channel<D::Protocol>, step: Step, command: CommandOf<D>) {
        let modem = self.modem.clone();
        let completion: Completion<D::Protocol> = Box::new(move |_, result| match result {
            Ok(_) => debug!(modem = %modem, "Compensating {} completed", step),
            Err(e) => warn!(modem = %modem, "Compensating {} failed: {}", step, e),
        });
        if let Err(e) = channel.submit(command, completion) {
            warn!(modem = %self.modem, "Compensating {} not sent: {}", step, e);
        }
    }

    // ========================================================================
    // Deactivation
    // ========================================================================

    /// Bring the active context `cid` down
    pub fn deactivate(&self, channel: &mut Channel<D::Protocol>, cid: u8, callback: DeactivateCallback) {
        let active = {
            let mut state = self.shared.lock();
            if state.operation.is_some() || state.deactivation.is_some() {
                drop(state);
                callback(Err(GprsError::Busy));
                return;
            }
            match state.active.clone() {
                Some(active) if active.cid == cid => {
                    state.deactivation = Some(Deactivation { cid, callback });
                    active
                },
                _ => {
                    drop(state);
                    callback(Err(GprsError::NotActive(cid)));
                    return;
                },
            }
        };

        info!(modem = %self.modem, "Deactivating context cid={}", cid);
        let Some(command) = self.driver.deactivate(&active) else {
            self.on_deactivate_done(cid, Ok(()));
            return;
        };

        let context = self.clone();
        let submitted = channel.submit(
            command,
            Box::new(move |_, result| {
                let result = result
                    .map(|_| ())
                    .map_err(|e| GprsError::step(Step::Deactivate, e));
                context.on_deactivate_done(cid, result);
            }),
        );
        if let Err(e) = submitted {
            self.on_deactivate_done(cid, Err(e.into()));
        }
    }

    fn on_deactivate_done(&self, cid: u8, result: Result<(), GprsError>) {
        let (callback, cleared) = {
            let mut state = self.shared.lock();
            let callback = state
                .deactivation
                .take()
                .filter(|d| d.cid == cid)
                .map(|d| d.callback);
            let owns_marker = state.active.as_ref().is_some_and(|a| a.cid == cid);
            let cleared = if result.is_ok() && owns_marker {
                state.active.take()
            } else {
                None
            };
            (callback, cleared)
        };

        match &result {
            Ok(()) => info!(modem = %self.modem, "Context cid={} deactivated", cid),
            Err(e) => warn!(modem = %self.modem, "Deactivation of cid={} failed: {}", cid, e),
        }
        if let Some(context) = cleared {
            (self.notify)(ModemEvent::ContextDeactivated {
                modem: self.modem.clone(),
                cid: context.cid,
                reason: DeactivationReason::Local,
            });
        }
        if let Some(callback) = callback {
            callback(result);
        }
    }

    // ========================================================================
    // Revocation
    // ========================================================================

    fn on_revocation(&self, frame: &FrameOf<D>) {
        let revoked = {
            let mut state = self.shared.lock();
            let matches = state
                .active
                .as_ref()
                .is_some_and(|active| self.driver.is_revocation(frame, active));
            if matches {
                state.active.take()
            } else {
                None
            }
        };

        let Some(context) = revoked else {
            return;
        };
        warn!(modem = %self.modem, "Context cid={} deactivated by the network", context.cid);
        (self.notify)(ModemEvent::ContextDeactivated {
            modem: self.modem.clone(),
            cid: context.cid,
            reason: DeactivationReason::Network,
        });
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::facade::testing::{outcome, recorded_events, wire_channel, Outcome};
    use modem_link::ChannelState;
    use modem_protocols::at::AtProtocol;
    use std::net::Ipv4Addr;
    use tracing_test::traced_test;

    struct Harness {
        channel: Channel<AtProtocol>,
        wire: Arc<Mutex<Vec<String>>>,
        events: Arc<Mutex<Vec<ModemEvent>>>,
        context: DataContext<AtContextDriver>,
    }

    impl Harness {
        fn new() -> Self {
            let (mut channel, wire) = wire_channel(AtProtocol::new());
            let (hook, events) = recorded_events();
            let context = DataContext::new("wwan0", AtContextDriver::new(), hook);
            context.install(&mut channel);
            Self {
                channel,
                wire,
                events,
                context,
            }
        }

        fn activate(&mut self, request: DataContextRequest) -> Outcome<ActiveContext> {
            let (callback, result) = outcome();
            self.context.activate(&mut self.channel, request, callback);
            result
        }

        fn deactivate(&mut self, cid: u8) -> Outcome<()> {
            let (callback, result) = outcome();
            self.context.deactivate(&mut self.channel, cid, callback);
            result
        }

        fn reply(&mut self, text: &str) {
            self.channel.on_bytes_received(text.as_bytes());
        }

        fn written(&self) -> Vec<String> {
            self.wire.lock().clone()
        }

        fn events(&self) -> Vec<ModemEvent> {
            self.events.lock().clone()
        }

        fn activate_fully(&mut self) -> ActiveContext {
            let result = self.activate(DataContextRequest::new(1, "internet"));
            self.reply("\r\nOK\r\n");
            self.reply("\r\nOK\r\n");
            self.reply(CGCONTRDP);
            let x = result.lock().take().unwrap().unwrap();
            x
        }
    }

    const CGCONTRDP: &str =
        "\r\n+CGCONTRDP: 1,5,\"internet\",\"10.0.0.2.255.255.255.0\",\"10.0.0.1\",\"8.8.8.8\",\"8.8.4.4\"\r\n\r\nOK\r\n";

    // ========================================================================
    // Activation Tests
    // ========================================================================

    #[test]
    fn test_activation_walks_all_steps() {
        let mut h = Harness::new();
        let result = h.activate(DataContextRequest::new(1, "internet"));

        assert_eq!(h.written(), vec!["AT+CGDCONT=1,\"IP\",\"internet\""]);
        assert_eq!(h.context.activation_state(), Some(ActivationState::Init));

        h.reply("\r\nOK\r\n");
        assert_eq!(h.written()[1], "AT+CGACT=1,1");
        assert_eq!(h.context.activation_state(), Some(ActivationState::Defined));

        h.reply("\r\nOK\r\n");
        assert_eq!(h.written()[2], "AT+CGCONTRDP=1");
        assert_eq!(h.context.activation_state(), Some(ActivationState::Activated));

        h.reply(CGCONTRDP);
        let active = result.lock().take().unwrap().unwrap();
        assert_eq!(active.cid, 1);
        assert_eq!(active.settings.address, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))));
        assert_eq!(active.settings.netmask, Some(IpAddr::V4(Ipv4Addr::new(255, 255, 255, 0))));
        assert_eq!(active.settings.gateway, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert_eq!(active.settings.dns.len(), 2);

        assert_eq!(h.context.active_context(), Some(active.clone()));
        assert_eq!(h.context.activation_state(), None);
        assert_eq!(h.context.last_outcome(), Some(ActivationState::Done));
        assert_eq!(
            h.events(),
            vec![ModemEvent::ContextActivated {
                modem: "wwan0".to_string(),
                context: active
            }]
        );
    }

    #[test]
    fn test_second_activation_is_busy() {
        let mut h = Harness::new();
        let first = h.activate(DataContextRequest::new(1, "internet"));
        let second = h.activate(DataContextRequest::new(2, "other"));

        assert_eq!(second.lock().take(), Some(Err(GprsError::Busy)));
        assert!(first.lock().is_none());
        assert_eq!(h.written().len(), 1);
    }

    #[test]
    fn test_activation_of_active_context_rejected() {
        let mut h = Harness::new();
        h.activate_fully();
        let again = h.activate(DataContextRequest::new(3, "internet"));
        assert_eq!(again.lock().take(), Some(Err(GprsError::AlreadyActive(1))));
    }

    #[test]
    fn test_invalid_request_rejected() {
        let mut h = Harness::new();
        let result = h.activate(DataContextRequest::new(1, "  "));
        assert!(matches!(
            result.lock().take(),
            Some(Err(GprsError::InvalidRequest(_)))
        ));
        assert!(h.written().is_empty());
        assert!(!h.context.is_busy());
    }

    // ========================================================================
    // Failure and Compensation Tests
    // ========================================================================

    #[test]
    fn test_define_failure_has_no_compensation() {
        let mut h = Harness::new();
        let result = h.activate(DataContextRequest::new(1, "internet"));
        h.reply("\r\n+CME ERROR: 30\r\n");

        assert_eq!(
            result.lock().take(),
            Some(Err(GprsError::StepFailed {
                step: Step::Define,
                error: RequestError::device(30, "+CME ERROR: 30")
            }))
        );
        assert_eq!(h.written().len(), 1);
        assert_eq!(h.context.last_outcome(), Some(ActivationState::Failed));
        assert!(h.events().is_empty());
    }

    #[test]
    #[traced_test]
    fn test_activate_failure_undefines() {
        let mut h = Harness::new();
        let result = h.activate(DataContextRequest::new(1, "internet"));
        h.reply("\r\nOK\r\n");
        h.reply("\r\n+CME ERROR: 148\r\n");

        assert!(matches!(
            result.lock().take(),
            Some(Err(GprsError::StepFailed { step: Step::Activate, .. }))
        ));
        assert_eq!(h.written().last().unwrap(), "AT+CGDCONT=1");

        h.reply("\r\nERROR\r\n");
        assert!(logs_contain("Compensating undefine failed"));
        assert!(!h.context.is_busy());
    }

    #[test]
    fn test_fetch_failure_deactivates_before_reporting() {
        let mut h = Harness::new();
        let wire = h.wire.clone();
        let (hook, _) = recorded_events();
        let observed = Arc::new(Mutex::new(Vec::new()));
        let seen = observed.clone();
        h.context = DataContext::new("wwan0", AtContextDriver::new(), hook);

        h.context.activate(
            &mut h.channel,
            DataContextRequest::new(1, "internet"),
            Box::new(move |result| {
                // The compensating request is already on the wire
                seen.lock().push(wire.lock().last().cloned());
                assert!(result.is_err());
            }),
        );
        h.reply("\r\nOK\r\n");
        h.reply("\r\nOK\r\n");
        h.reply("\r\n+CME ERROR: 3\r\n");

        assert_eq!(*observed.lock(), vec![Some("AT+CGACT=0,1".to_string())]);
        assert_eq!(h.context.active_context(), None);
    }

    #[test]
    fn test_unparsable_settings_fail_activation() {
        let mut h = Harness::new();
        let result = h.activate(DataContextRequest::new(1, "internet"));
        h.reply("\r\nOK\r\n\r\nOK\r\n");
        h.reply("\r\nOK\r\n");

        assert!(matches!(
            result.lock().take(),
            Some(Err(GprsError::StepFailed {
                step: Step::FetchSettings,
                error: RequestError::DecodeFailure(_)
            }))
        ));
        assert_eq!(h.written().last().unwrap(), "AT+CGACT=0,1");
    }

    #[test]
    fn test_channel_close_fails_activation() {
        let mut h = Harness::new();
        let result = h.activate(DataContextRequest::new(1, "internet"));
        h.channel.on_transport_closed();

        assert_eq!(result.lock().take(), Some(Err(GprsError::ChannelClosed)));
        assert_eq!(h.channel.state(), ChannelState::Closed);
        assert!(!h.context.is_busy());

        let again = h.activate(DataContextRequest::new(1, "internet"));
        assert_eq!(again.lock().take(), Some(Err(GprsError::ChannelClosed)));
        assert!(!h.context.is_busy());
    }

    #[test]
    fn test_deactivate_on_closed_channel() {
        let mut h = Harness::new();
        let active = h.activate_fully();
        h.channel.close();

        let result = h.deactivate(active.cid);
        assert_eq!(result.lock().take(), Some(Err(GprsError::ChannelClosed)));
        assert!(!h.context.is_busy());
    }

    #[test]
    fn test_link_error_mapping() {
        assert_eq!(GprsError::from(LinkError::ChannelClosed), GprsError::ChannelClosed);
        assert_eq!(
            GprsError::from(LinkError::TransactionIdsExhausted),
            GprsError::Link(LinkError::TransactionIdsExhausted)
        );
    }

    // ========================================================================
    // Cancellation Tests
    // ========================================================================

    #[test]
    fn test_cancel_during_activate_compensates() {
        let mut h = Harness::new();
        let result = h.activate(DataContextRequest::new(1, "internet"));
        h.reply("\r\nOK\r\n");
        assert_eq!(h.context.activation_state(), Some(ActivationState::Defined));

        assert!(h.context.cancel_activation(&mut h.channel));
        assert_eq!(result.lock().take(), Some(Err(GprsError::Cancelled)));
        assert!(!h.context.cancel_activation(&mut h.channel));

        // The cancelled AT+CGACT still owns the line; its late OK is dropped
        assert_eq!(h.written().len(), 2);
        h.reply("\r\nOK\r\n");
        assert_eq!(h.written()[2], "AT+CGACT=0,1");
        h.reply("\r\nOK\r\n");
        assert_eq!(h.written()[3], "AT+CGDCONT=1");
        h.reply("\r\nOK\r\n");

        assert_eq!(h.channel.stats().tombstones_discarded, 1);
        assert_eq!(h.context.active_context(), None);
        assert!(h.events().is_empty());
    }

    #[test]
    fn test_cancel_during_define_undefines() {
        let mut h = Harness::new();
        let result = h.activate(DataContextRequest::new(4, "internet"));
        assert!(h.context.cancel_activation(&mut h.channel));
        assert_eq!(result.lock().take(), Some(Err(GprsError::Cancelled)));

        h.reply("\r\nOK\r\n");
        assert_eq!(h.written(), vec!["AT+CGDCONT=4,\"IP\",\"internet\"", "AT+CGDCONT=4"]);
    }

    // ========================================================================
    // Deactivation and Revocation Tests
    // ========================================================================

    #[test]
    fn test_deactivate_clears_marker() {
        let mut h = Harness::new();
        h.activate_fully();

        let result = h.deactivate(1);
        assert_eq!(h.written().last().unwrap(), "AT+CGACT=0,1");
        assert!(h.context.is_busy());
        h.reply("\r\nOK\r\n");

        assert_eq!(result.lock().take(), Some(Ok(())));
        assert_eq!(h.context.active_context(), None);
        assert_eq!(
            h.events().last(),
            Some(&ModemEvent::ContextDeactivated {
                modem: "wwan0".to_string(),
                cid: 1,
                reason: DeactivationReason::Local
            })
        );
    }

    #[test]
    fn test_deactivate_errors() {
        let mut h = Harness::new();
        let result = h.deactivate(1);
        assert_eq!(result.lock().take(), Some(Err(GprsError::NotActive(1))));

        h.activate_fully();
        let result = h.deactivate(1);
        h.reply("\r\n+CME ERROR: 4\r\n");
        assert!(matches!(
            result.lock().take(),
            Some(Err(GprsError::StepFailed { step: Step::Deactivate, .. }))
        ));
        assert!(h.context.active_context().is_some());
    }

    #[test]
    fn test_network_revocation_clears_marker() {
        let mut h = Harness::new();
        h.activate_fully();

        h.reply("\r\n+CGEV: NW PDN DEACT 2\r\n");
        assert!(h.context.active_context().is_some());

        h.reply("\r\n+CGEV: NW PDN DEACT 1\r\n");
        assert_eq!(h.context.active_context(), None);
        assert_eq!(
            h.events().last(),
            Some(&ModemEvent::ContextDeactivated {
                modem: "wwan0".to_string(),
                cid: 1,
                reason: DeactivationReason::Network
            })
        );

        // A later activation is accepted again
        let result = h.activate(DataContextRequest::new(1, "internet"));
        assert!(result.lock().is_none());
    }

    #[test]
    fn test_revocation_during_deactivation_notifies_once() {
        let mut h = Harness::new();
        h.activate_fully();
        let result = h.deactivate(1);

        h.reply("\r\n+CGEV: ME PDN DEACT 1\r\n");
        assert_eq!(h.context.active_context(), None);
        h.reply("\r\nOK\r\n");

        assert_eq!(result.lock().take(), Some(Ok(())));
        let deactivations = h
            .events()
            .into_iter()
            .filter(|e| matches!(e, ModemEvent::ContextDeactivated { .. }))
            .count();
        assert_eq!(deactivations, 1);
    }
}
