//! Channel: request queue, in-flight table and frame routing

use bytes::{Buf, BytesMut};
use serde::Serialize;
use std::collections::VecDeque;

use super::dispatcher::{Dispatcher, Handler, RegistrationId};
use super::pending::{Completion, PendingRequest, RequestHandle};
use crate::error::{LinkError, RequestError, Result};
use crate::traits::{
    ChannelLogger, ChannelState, Decoded, DispatchPolicy, Disposition, Protocol, TransactionId,
    Transport,
};

/// Default size of the in-flight table for keyed protocols
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;

/// Per-channel counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub submitted: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub closed: u64,
    pub frames_received: u64,
    pub notifications: u64,
    pub unroutable: u64,
    pub invalid: u64,
    pub tombstones_discarded: u64,
}

/// One connection to one modem
///
/// Owns the transport writer, the FIFO wait queue, the in-flight table and the
/// notification registrations. All methods must be called from the single
/// task that owns the channel.
pub struct Channel<P: Protocol> {
    protocol: P,
    policy: DispatchPolicy,
    transport: Option<Box<dyn Transport>>,
    state: ChannelState,
    logger: ChannelLogger,
    rx_buffer: BytesMut,
    queue: VecDeque<PendingRequest<P>>,
    in_flight: Vec<PendingRequest<P>>,
    /// Cancelled keyed requests; they hold a transaction id but no slot
    tombstones: Vec<PendingRequest<P>>,
    dispatcher: Dispatcher<P>,
    max_in_flight: usize,
    next_handle: u64,
    next_transaction_id: u32,
    stats: ChannelStats,
}

impl<P: Protocol> Channel<P> {
    /// Create an open channel writing to `transport`
    pub fn new(protocol: P, transport: Box<dyn Transport>, logger: ChannelLogger) -> Self {
        let policy = protocol.policy();
        let max_in_flight = match policy {
            DispatchPolicy::StrictFifo => 1,
            DispatchPolicy::TransactionKeyed => DEFAULT_MAX_IN_FLIGHT,
        };
        logger.log_init(protocol.name(), &format!("channel open, policy {:?}", policy));

        Self {
            protocol,
            policy,
            transport: Some(transport),
            state: ChannelState::Open,
            logger,
            rx_buffer: BytesMut::with_capacity(1024),
            queue: VecDeque::new(),
            in_flight: Vec::new(),
            tombstones: Vec::new(),
            dispatcher: Dispatcher::new(),
            max_in_flight,
            next_handle: 1,
            next_transaction_id: 1,
            stats: ChannelStats::default(),
        }
    }

    /// Set the in-flight table size of a keyed channel
    ///
    /// STRICT_FIFO channels always keep a single slot.
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        if self.policy == DispatchPolicy::TransactionKeyed {
            self.max_in_flight = max.max(1);
        }
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn logger(&self) -> &ChannelLogger {
        &self.logger
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Requests waiting for a free in-flight slot
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Requests occupying an in-flight slot
    ///
    /// A cancelled STRICT_FIFO command keeps its slot until the device
    /// answers; cancelled keyed requests do not.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Cancelled keyed requests whose late response is still expected
    pub fn tombstone_len(&self) -> usize {
        self.tombstones.len()
    }

    /// Number of live notification registrations
    pub fn registration_count(&self) -> usize {
        self.dispatcher.len()
    }

    /// Check whether `handle` still waits for its outcome
    pub fn is_pending(&self, handle: RequestHandle) -> bool {
        self.queue.iter().any(|r| r.handle == handle)
            || self
                .in_flight
                .iter()
                .any(|r| r.handle == handle && !r.is_tombstone())
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Queue a command and write it as soon as the policy allows
    ///
    /// The completion fires exactly once. If the command is rejected here no
    /// state changes and the completion is dropped without being called.
    pub fn submit(&mut self, command: P::Command, completion: Completion<P>) -> Result<RequestHandle> {
        if !self.state.is_open() {
            return Err(LinkError::ChannelClosed);
        }

        let transaction_id = match self.policy {
            DispatchPolicy::StrictFifo => None,
            DispatchPolicy::TransactionKeyed => Some(self.allocate_transaction_id()?),
        };
        let bytes = self.protocol.encode(&command, transaction_id)?;

        let handle = RequestHandle(self.next_handle);
        self.next_handle += 1;
        if let Some(tid) = transaction_id {
            self.next_transaction_id = tid.0.wrapping_add(1);
        }

        tracing::trace!(
            channel = %self.logger.channel_name,
            handle = %handle,
            "Queued {:?}",
            command
        );
        self.queue.push_back(PendingRequest::new(
            handle,
            transaction_id,
            command,
            bytes,
            completion,
        ));
        self.stats.submitted += 1;
        self.pump();

        Ok(handle)
    }

    /// Withdraw a request
    ///
    /// Returns `true` if the completion was fired with `Cancelled`. An
    /// in-flight request leaves a tombstone so its late response is dropped.
    /// On keyed channels the tombstone only reserves its transaction id and
    /// the slot goes to the next queued request.
    pub fn cancel(&mut self, handle: RequestHandle) -> bool {
        if let Some(index) = self.queue.iter().position(|r| r.handle == handle) {
            let completion = self
                .queue
                .remove(index)
                .and_then(|mut request| request.completion.take());
            return self.fire_cancelled(handle, completion);
        }

        let Some(index) = self.in_flight.iter().position(|r| r.handle == handle) else {
            return false;
        };
        let completion = self.in_flight[index].completion.take();
        if completion.is_some() && self.policy == DispatchPolicy::TransactionKeyed {
            let tombstone = self.in_flight.remove(index);
            self.tombstones.push(tombstone);
        }

        let cancelled = self.fire_cancelled(handle, completion);
        self.pump();
        cancelled
    }

    fn fire_cancelled(&mut self, handle: RequestHandle, completion: Option<Completion<P>>) -> bool {
        match completion {
            Some(completion) => {
                self.stats.cancelled += 1;
                tracing::debug!(channel = %self.logger.channel_name, handle = %handle, "Request cancelled");
                completion(self, Err(RequestError::Cancelled));
                true
            },
            None => false,
        }
    }

    /// Pick a transaction id unused by any queued or in-flight request
    fn allocate_transaction_id(&self) -> Result<TransactionId> {
        let max = self.protocol.max_transaction_id().max(1);
        let in_use = |tid: u32| {
            self.queue
                .iter()
                .chain(self.in_flight.iter())
                .chain(self.tombstones.iter())
                .any(|r| r.transaction_id == Some(TransactionId(tid)))
        };

        let start = if (1..=max).contains(&self.next_transaction_id) {
            self.next_transaction_id
        } else {
            1
        };
        (0..max)
            .map(|offset| ((u64::from(start) - 1 + u64::from(offset)) % u64::from(max)) as u32 + 1)
            .find(|tid| !in_use(*tid))
            .map(TransactionId)
            .ok_or(LinkError::TransactionIdsExhausted)
    }

    /// Move queued requests to the device while slots are free
    fn pump(&mut self) {
        while self.state.is_open() && self.in_flight.len() < self.max_in_flight {
            let Some(request) = self.queue.pop_front() else {
                break;
            };
            let Some(transport) = self.transport.as_mut() else {
                self.queue.push_front(request);
                self.shutdown("transport detached");
                return;
            };

            match transport.write(&request.bytes) {
                Ok(()) => {
                    self.logger.log_raw_frame("TX", &request.bytes);
                    self.in_flight.push(request);
                },
                Err(e) => {
                    self.queue.push_front(request);
                    self.shutdown(&format!("write rejected: {}", e));
                    return;
                },
            }
        }
    }

    // ========================================================================
    // Receive path
    // ========================================================================

    /// Feed bytes read from the device
    ///
    /// Partial frames stay buffered until the rest arrives.
    pub fn on_bytes_received(&mut self, data: &[u8]) {
        if !self.state.is_open() {
            return;
        }
        self.logger.log_raw_frame("RX", data);
        self.rx_buffer.extend_from_slice(data);

        while self.state.is_open() && !self.rx_buffer.is_empty() {
            match self.protocol.decode(&self.rx_buffer) {
                Decoded::Frame { consumed, frame } => {
                    let consumed = consumed.clamp(1, self.rx_buffer.len());
                    self.rx_buffer.advance(consumed);
                    self.on_frame_received(frame);
                },
                Decoded::NeedMoreData => break,
                Decoded::Invalid { skip, reason } => {
                    let skip = skip.clamp(1, self.rx_buffer.len());
                    self.rx_buffer.advance(skip);
                    self.stats.invalid += 1;
                    self.logger.log_invalid(skip, &reason);
                },
            }
        }
    }

    /// Route one decoded frame: pending request first, then registrations
    pub fn on_frame_received(&mut self, frame: P::Frame) {
        if !self.state.is_open() {
            return;
        }
        self.stats.frames_received += 1;
        self.logger.log_frame("RX", &frame);

        let Some(frame) = self.route_to_request(frame) else {
            return;
        };
        if self.notify(&frame) {
            return;
        }

        self.stats.unroutable += 1;
        self.logger.log_unroutable(&frame);
    }

    /// Hand the frame to the matching in-flight request, or give it back
    fn route_to_request(&mut self, frame: P::Frame) -> Option<P::Frame> {
        let index = match self.policy {
            DispatchPolicy::StrictFifo => (!self.in_flight.is_empty()).then_some(0),
            DispatchPolicy::TransactionKeyed => self
                .protocol
                .transaction_id(&frame)
                .and_then(|tid| {
                    self.in_flight
                        .iter()
                        .position(|r| r.transaction_id == Some(tid))
                }),
        };
        let Some(index) = index else {
            return self.route_to_tombstone(frame);
        };

        match self.protocol.classify(&self.in_flight[index].command, &frame) {
            Disposition::Unrelated => Some(frame),
            Disposition::Intermediate => {
                self.in_flight[index].intermediates.push(frame);
                None
            },
            Disposition::Final => {
                let request = self.in_flight.remove(index);
                self.finish(request, frame);
                self.pump();
                None
            },
        }
    }

    /// Swallow late frames of cancelled keyed requests
    fn route_to_tombstone(&mut self, frame: P::Frame) -> Option<P::Frame> {
        let index = self.protocol.transaction_id(&frame).and_then(|tid| {
            self.tombstones
                .iter()
                .position(|r| r.transaction_id == Some(tid))
        });
        let Some(index) = index else {
            return Some(frame);
        };

        match self.protocol.classify(&self.tombstones[index].command, &frame) {
            Disposition::Unrelated => Some(frame),
            Disposition::Intermediate => None,
            Disposition::Final => {
                self.tombstones.remove(index);
                self.stats.tombstones_discarded += 1;
                self.logger.log_tombstone(&frame);
                None
            },
        }
    }

    fn finish(&mut self, mut request: PendingRequest<P>, terminal: P::Frame) {
        let Some(completion) = request.completion.take() else {
            self.stats.tombstones_discarded += 1;
            self.logger.log_tombstone(&terminal);
            return;
        };

        let intermediates = std::mem::take(&mut request.intermediates);
        let result = self.protocol.complete(&request.command, intermediates, terminal);
        self.stats.completed += 1;
        tracing::debug!(
            channel = %self.logger.channel_name,
            handle = %request.handle,
            elapsed_ms = request.enqueued_at.elapsed().as_millis() as u64,
            success = result.is_ok(),
            "Request completed"
        );
        completion(self, result);
    }

    /// Fan the frame out to matching registrations, oldest first
    fn notify(&mut self, frame: &P::Frame) -> bool {
        let selected = self.dispatcher.select(&self.protocol, frame);
        if selected.is_empty() {
            return false;
        }
        self.stats.notifications += 1;

        for entry in selected {
            if !self.state.is_open() {
                break;
            }
            // A handler re-entering dispatch must not run itself again
            let Some(mut guard) = entry.handler.try_lock() else {
                tracing::trace!(channel = %self.logger.channel_name, registration = %entry.id, "Skipping re-entered handler");
                continue;
            };
            if entry.one_shot {
                tracing::trace!(channel = %self.logger.channel_name, registration = %entry.id, "One-shot registration fired");
            }
            let handler: &mut Handler<P> = &mut guard;
            handler(self, frame);
        }
        true
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    /// Subscribe to unsolicited frames matching `pattern`
    ///
    /// A registration added from inside a handler does not see the frame
    /// currently being dispatched. Registering on a closed channel is a no-op
    /// apart from returning an id that is never live.
    pub fn register(&mut self, pattern: P::Pattern, one_shot: bool, handler: Handler<P>) -> RegistrationId {
        if !self.state.is_open() {
            tracing::debug!(channel = %self.logger.channel_name, "Ignoring registration on {} channel", self.state);
            return self.dispatcher.reserve_id();
        }
        self.dispatcher.register(pattern, one_shot, handler)
    }

    /// Remove a registration; `false` if it was not live
    pub fn unregister(&mut self, id: RegistrationId) -> bool {
        self.dispatcher.unregister(id)
    }

    pub fn is_registered(&self, id: RegistrationId) -> bool {
        self.dispatcher.contains(id)
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Close the channel on request of its owner
    pub fn close(&mut self) {
        self.shutdown("closed by owner");
    }

    /// The transport reported link loss
    pub fn on_transport_closed(&mut self) {
        self.shutdown("transport closed");
    }

    /// Fail every outstanding request with `ChannelClosed` and detach
    ///
    /// In-flight requests are failed before queued ones, each group in
    /// submission order. Calling it again is a no-op.
    fn shutdown(&mut self, reason: &str) {
        if self.state != ChannelState::Open {
            return;
        }
        self.set_state(ChannelState::Closing, reason);

        let mut outstanding: Vec<PendingRequest<P>> = self.in_flight.drain(..).collect();
        outstanding.sort_by_key(|r| r.handle);
        outstanding.extend(self.queue.drain(..));
        self.tombstones.clear();
        self.dispatcher.clear();
        self.rx_buffer.clear();

        for mut request in outstanding {
            if let Some(completion) = request.completion.take() {
                self.stats.closed += 1;
                completion(self, Err(RequestError::ChannelClosed));
            }
        }

        self.transport = None;
        self.set_state(ChannelState::Closed, reason);
    }

    fn set_state(&mut self, new_state: ChannelState, reason: &str) {
        let old_state = self.state;
        self.state = new_state;
        self.logger.log_status(old_state, new_state, reason);
    }
}

impl<P: Protocol> Drop for Channel<P> {
    fn drop(&mut self) {
        self.shutdown("channel dropped");
    }
}

// ============================================================================
// Tests
// ============================================================================
