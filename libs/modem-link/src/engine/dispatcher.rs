//! Notification registrations
//!
//! Registrations are kept in registration order. A dispatch pass works on a
//! snapshot of the entries matching the frame, so callbacks may register or
//! unregister freely while the pass runs.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use super::channel::Channel;
use crate::traits::Protocol;

/// Notification callback
pub type Handler<P> = Box<dyn FnMut(&mut Channel<P>, &<P as Protocol>::Frame) + Send>;

/// Identifier returned by `Channel::register`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(pub(crate) u64);

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reg#{}", self.0)
    }
}

type SharedHandler<P> = Arc<Mutex<Handler<P>>>;

struct Registration<P: Protocol> {
    id: RegistrationId,
    pattern: P::Pattern,
    one_shot: bool,
    handler: SharedHandler<P>,
}

/// Entry selected for one dispatch pass
pub(crate) struct Selected<P: Protocol> {
    pub id: RegistrationId,
    pub one_shot: bool,
    pub handler: SharedHandler<P>,
}

/// Ordered registry of notification subscriptions
pub(crate) struct Dispatcher<P: Protocol> {
    registrations: Vec<Registration<P>>,
    next_id: u64,
}

impl<P: Protocol> Dispatcher<P> {
    pub fn new() -> Self {
        Self {
            registrations: Vec::new(),
            next_id: 1,
        }
    }

    pub fn register(&mut self, pattern: P::Pattern, one_shot: bool, handler: Handler<P>) -> RegistrationId {
        let id = self.reserve_id();
        self.registrations.push(Registration {
            id,
            pattern,
            one_shot,
            handler: Arc::new(Mutex::new(handler)),
        });
        id
    }

    /// Allocate an id without creating a registration
    pub fn reserve_id(&mut self) -> RegistrationId {
        let id = RegistrationId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn unregister(&mut self, id: RegistrationId) -> bool {
        match self.registrations.iter().position(|r| r.id == id) {
            Some(index) => {
                self.registrations.remove(index);
                true
            },
            None => false,
        }
    }

    pub fn contains(&self, id: RegistrationId) -> bool {
        self.registrations.iter().any(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn clear(&mut self) {
        self.registrations.clear();
    }

    /// Snapshot of registrations matching `frame`, oldest first
    ///
    /// One-shot entries are removed from the registry as they are selected,
    /// so a nested dispatch pass can never fire them a second time.
    pub fn select(&mut self, protocol: &P, frame: &P::Frame) -> Vec<Selected<P>> {
        let selected: Vec<Selected<P>> = self
            .registrations
            .iter()
            .filter(|r| protocol.matches(&r.pattern, frame))
            .map(|r| Selected {
                id: r.id,
                one_shot: r.one_shot,
                handler: Arc::clone(&r.handler),
            })
            .collect();

        if selected.iter().any(|s| s.one_shot) {
            self.registrations
                .retain(|r| !(r.one_shot && selected.iter().any(|s| s.id == r.id)));
        }
        selected
    }
}
