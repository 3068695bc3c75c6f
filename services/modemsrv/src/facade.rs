//! Modem Facades
//!
//! Higher-level operations composed from the primitive requests of a
//! protocol family, running on top of a `modem_link::Channel`.
//!
//! ```text
//! facade
//!     ├── gprs     (data-context activation state machine + drivers)
//!     ├── service  (object-safe access from other tasks)
//!     └── events   (notifications towards the owning subsystem)
//! ```

pub mod events;
pub mod gprs;
pub mod service;

pub use events::{log_events, DeactivationReason, ModemEvent, NotifyHook};
pub use gprs::{
    ActivateCallback, ActivationState, ActiveContext, AtContextDriver, ContextDriver,
    ContextSettings, DataContext, DataContextRequest, DeactivateCallback, GprsError,
    QmiContextDriver, Step,
};
pub use service::{DataContextService, RemoteDataContext};
