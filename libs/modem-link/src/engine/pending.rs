//! Pending request records

use bytes::Bytes;
use std::fmt;
use std::time::Instant;

use super::channel::Channel;
use crate::error::RequestResult;
use crate::traits::{Protocol, TransactionId};

/// Completion callback of a request
///
/// Invoked exactly once with the channel the request was submitted on, so the
/// callback can submit follow-up requests.
pub type Completion<P> =
    Box<dyn FnOnce(&mut Channel<P>, RequestResult<<P as Protocol>::Response>) + Send>;

/// Opaque cancellation handle returned by `Channel::submit`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestHandle(pub(crate) u64);

impl fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One request owned by the engine, queued or in flight
pub(crate) struct PendingRequest<P: Protocol> {
    pub handle: RequestHandle,
    pub transaction_id: Option<TransactionId>,
    pub command: P::Command,
    pub bytes: Bytes,
    pub intermediates: Vec<P::Frame>,
    /// `None` once the caller has been answered: the entry is a tombstone
    pub completion: Option<Completion<P>>,
    pub enqueued_at: Instant,
}

impl<P: Protocol> PendingRequest<P> {
    pub fn new(
        handle: RequestHandle,
        transaction_id: Option<TransactionId>,
        command: P::Command,
        bytes: Bytes,
        completion: Completion<P>,
    ) -> Self {
        Self {
            handle,
            transaction_id,
            command,
            bytes,
            intermediates: Vec::new(),
            completion: Some(completion),
            enqueued_at: Instant::now(),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.completion.is_none()
    }
}

impl<P: Protocol> fmt::Debug for PendingRequest<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("handle", &self.handle)
            .field("transaction_id", &self.transaction_id)
            .field("command", &self.command)
            .field("bytes", &self.bytes.len())
            .field("intermediates", &self.intermediates.len())
            .field("tombstone", &self.is_tombstone())
            .finish()
    }
}
