//! Event publishing/subscription abstraction (mechanics only).
//!
//! This module provides the **event bus pattern** - a pub/sub mechanism for
//! distributing command events to any number of observers (status UIs,
//! composed commands, tests).
//!
//! ## Delivery
//!
//! - **Broadcast**: every subscription receives every message published after it
//!   was created.
//! - **Ordered**: messages arrive in publication order.
//! - **Lossless**: a slow subscription buffers; it never skips messages.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::stream::{BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// A subscription to an event stream.
///
/// ## Usage Pattern
///
/// ```ignore
/// let mut subscription = bus.subscribe();
/// while let Some(event) = subscription.recv().await {
///     process(event);
/// }
/// // `None`: the bus was dropped
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: mpsc::UnboundedReceiver<M>,
    backlog: Arc<AtomicUsize>,
}

impl<M> Subscription<M> {
    /// `backlog` counts messages sent but not yet received.
    pub fn new(receiver: mpsc::UnboundedReceiver<M>, backlog: Arc<AtomicUsize>) -> Self {
        Self { receiver, backlog }
    }

    fn received(&self, message: M) -> M {
        self.backlog.fetch_sub(1, Ordering::AcqRel);
        message
    }

    /// Wait for the next message. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<M> {
        let message = self.receiver.recv().await?;
        Some(self.received(message))
    }

    /// The next message if one is already buffered.
    pub fn try_recv(&mut self) -> Option<M> {
        match self.receiver.try_recv() {
            Ok(message) => Some(self.received(message)),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// All messages that are already buffered, in order.
    pub fn drain(&mut self) -> Vec<M> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

impl<M: Send + 'static> Subscription<M> {
    /// Convert into a stream that ends when the bus is dropped.
    pub fn into_stream(self) -> BoxStream<'static, M> {
        let backlog = self.backlog;
        UnboundedReceiverStream::new(self.receiver)
            .inspect(move |_| {
                backlog.fetch_sub(1, Ordering::AcqRel);
            })
            .boxed()
    }
}

/// Transport-agnostic event bus (pub/sub abstraction).
///
/// ## Thread Safety
///
/// The trait requires `Send + Sync`, meaning implementations must be safe to
/// share across threads. Ordering between concurrent publishers is whatever
/// order they reach the bus in; callers that need a total order serialise
/// their publishes (see `ResultChannel`).
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    /// Publish to every current subscriber, returning how many received it.
    fn publish(&self, message: M) -> Result<usize, Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<usize, Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
