//! Correlation Engine
//!
//! A [`Channel`] owns one device connection and guarantees that every
//! submitted request yields exactly one outcome, using a single ordered byte
//! stream shared with unsolicited traffic.
//!
//! ```text
//! engine
//!     ├── Channel     (queue, in-flight table, frame routing, close)
//!     ├── Dispatcher  (notification registrations, fan-out)
//!     └── pending     (request records, handles, tombstones)
//! ```
//!
//! The engine is single-threaded: every method takes `&mut Channel`, and
//! completion / notification callbacks receive the same `&mut Channel` so they
//! can issue follow-up requests without any locking. Callers that do device
//! I/O on other tasks must marshal bytes and calls onto the task owning the
//! channel.

mod channel;
mod dispatcher;
mod pending;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{Channel, ChannelStats, DEFAULT_MAX_IN_FLIGHT};
pub use dispatcher::{Handler, RegistrationId};
pub use pending::{Completion, RequestHandle};
