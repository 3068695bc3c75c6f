//! Data-context access from outside the channel task

use tokio::sync::oneshot;
use tracing::warn;

use super::gprs::{
    ActivateCallback, ActiveContext, ContextDriver, DataContext, DataContextRequest,
    DeactivateCallback, GprsError,
};
use crate::core::runtime::ChannelHandle;

/// Data-context operations of one modem, independent of the protocol family
///
/// Every operation answers through its callback exactly once; the callback
/// runs on the channel task.
pub trait DataContextService: Send + Sync {
    fn modem(&self) -> &str;

    fn activate(&self, request: DataContextRequest, callback: ActivateCallback);

    fn deactivate(&self, cid: u8, callback: DeactivateCallback);

    fn cancel_activation(&self);

    fn active_context(&self) -> Option<ActiveContext>;
}

impl dyn DataContextService {
    pub async fn activate_and_wait(&self, request: DataContextRequest) -> Result<ActiveContext, GprsError> {
        let (tx, rx) = oneshot::channel();
        self.activate(
            request,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx.await.unwrap_or(Err(GprsError::ChannelClosed))
    }

    pub async fn deactivate_and_wait(&self, cid: u8) -> Result<(), GprsError> {
        let (tx, rx) = oneshot::channel();
        self.deactivate(
            cid,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx.await.unwrap_or(Err(GprsError::ChannelClosed))
    }
}

/// `DataContext` reached through the handle of its channel task
pub struct RemoteDataContext<D: ContextDriver> {
    context: DataContext<D>,
    channel: ChannelHandle<D::Protocol>,
}

impl<D: ContextDriver> RemoteDataContext<D> {
    pub fn new(context: DataContext<D>, channel: ChannelHandle<D::Protocol>) -> Self {
        Self { context, channel }
    }

    pub fn context(&self) -> &DataContext<D> {
        &self.context
    }
}

/// Answer stored until the job runs or is dropped unrun
struct Pending<T>(Option<Box<dyn FnOnce(Result<T, GprsError>) + Send>>);

impl<T> Pending<T> {
    fn take(mut self) -> Box<dyn FnOnce(Result<T, GprsError>) + Send> {
        // Always Some until taken or dropped
        match self.0.take() {
            Some(callback) => callback,
            None => Box::new(|_| {}),
        }
    }
}

impl<T> Drop for Pending<T> {
    fn drop(&mut self) {
        if let Some(callback) = self.0.take() {
            callback(Err(GprsError::ChannelClosed));
        }
    }
}

impl<D: ContextDriver> DataContextService for RemoteDataContext<D> {
    fn modem(&self) -> &str {
        self.context.modem()
    }

    fn activate(&self, request: DataContextRequest, callback: ActivateCallback) {
        let context = self.context.clone();
        let pending = Pending(Some(callback));
        if let Err(e) = self.channel.execute(move |channel| {
            context.activate(channel, request, pending.take());
        }) {
            // The rejected job was dropped, answering with ChannelClosed
            warn!(modem = %self.context.modem(), "Activation not scheduled: {}", e);
        }
    }

    fn deactivate(&self, cid: u8, callback: DeactivateCallback) {
        let context = self.context.clone();
        let pending = Pending(Some(callback));
        if let Err(e) = self.channel.execute(move |channel| {
            context.deactivate(channel, cid, pending.take());
        }) {
            warn!(modem = %self.context.modem(), "Deactivation not scheduled: {}", e);
        }
    }

    fn cancel_activation(&self) {
        let context = self.context.clone();
        if let Err(e) = self.channel.execute(move |channel| {
            context.cancel_activation(channel);
        }) {
            warn!(modem = %self.context.modem(), "Cancellation not scheduled: {}", e);
        }
    }

    fn active_context(&self) -> Option<ActiveContext> {
        self.context.active_context()
    }
}
