//! Emit-only view over a channel, used by the job submitter.

use std::sync::Arc;

use crate::error::ChannelError;
use crate::message::DispatchMessage;
use crate::queue::DispatchQueue;
use crate::stream::FanoutStream;

pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, message: DispatchMessage) -> Result<(), ChannelError>;
}

impl<D> Dispatcher for Arc<D>
where
    D: Dispatcher + ?Sized,
{
    fn dispatch(&self, message: DispatchMessage) -> Result<(), ChannelError> {
        (**self).dispatch(message)
    }
}

/// Emits onto a [`DispatchQueue`].
#[derive(Debug, Clone)]
pub struct QueueDispatcher<Q> {
    queue: Q,
}

impl<Q: DispatchQueue> QueueDispatcher<Q> {
    pub fn new(queue: Q) -> Self {
        Self { queue }
    }
}

impl<Q: DispatchQueue> Dispatcher for QueueDispatcher<Q> {
    fn dispatch(&self, message: DispatchMessage) -> Result<(), ChannelError> {
        self.queue.send(message)
    }
}

/// Emits onto a [`FanoutStream`], partitioned by tile so a tile's periods stay ordered.
#[derive(Debug, Clone)]
pub struct StreamDispatcher<S> {
    stream: S,
}

impl<S: FanoutStream> StreamDispatcher<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

impl<S: FanoutStream> Dispatcher for StreamDispatcher<S> {
    fn dispatch(&self, message: DispatchMessage) -> Result<(), ChannelError> {
        let key = message.tile_id.as_str().to_string();
        self.stream.publish(&key, message).map(|_| ())
    }
}
