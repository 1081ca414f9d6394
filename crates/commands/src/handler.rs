//! What a handler returns.
//!
//! A handler is any `Fn(A, CancelSignal) -> HandlerOutput<T>`. The output
//! tells the command how the invocation ends:
//!
//! - [`HandlerOutput::Ready`]: finished synchronously, one result or a failure.
//! - [`HandlerOutput::Future`]: one result (or an abort) once the future resolves.
//! - [`HandlerOutput::Stream`]: every item is a result; the invocation ends when
//!   the stream ends (with the last item) or yields an error.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, Stream, StreamExt};

use reflex_core::{CancelSignal, CommandError, CommandResult};

/// Shared handler function.
pub type Handler<A, T> = Arc<dyn Fn(A, CancelSignal) -> HandlerOutput<T> + Send + Sync>;

/// Resolution of a trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The invocation ran to completion. `None` when it produced no value
    /// (e.g. an empty stream) or when a not-triggered trigger echoes a command
    /// that has no result yet.
    Completed(Option<T>),
    /// Nothing ran: the trigger was rejected, vetoed or cancelled.
    Aborted,
}

impl<T> Outcome<T> {
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Completed(value) => value.as_ref(),
            Self::Aborted => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Completed(value) => value,
            Self::Aborted => None,
        }
    }
}

pub enum HandlerOutput<T> {
    Ready(CommandResult<T>),
    Future(BoxFuture<'static, CommandResult<Outcome<T>>>),
    Stream(BoxStream<'static, CommandResult<T>>),
}

impl<T: Send + 'static> HandlerOutput<T> {
    pub fn value(value: T) -> Self {
        Self::Ready(Ok(value))
    }

    pub fn error(err: CommandError) -> Self {
        Self::Ready(Err(err))
    }

    pub fn future<F>(fut: F) -> Self
    where
        F: Future<Output = CommandResult<T>> + Send + 'static,
    {
        Self::Future(Box::pin(async move { fut.await.map(|v| Outcome::Completed(Some(v))) }))
    }

    /// A future that decides the whole outcome itself, aborts included.
    pub fn deferred<F>(fut: F) -> Self
    where
        F: Future<Output = CommandResult<Outcome<T>>> + Send + 'static,
    {
        Self::Future(Box::pin(fut))
    }

    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = CommandResult<T>> + Send + 'static,
    {
        Self::Stream(stream.boxed())
    }

    /// Flatten any output into a stream of results.
    ///
    /// An aborted or empty future becomes an empty stream.
    pub fn into_stream(self) -> BoxStream<'static, CommandResult<T>> {
        match self {
            Self::Ready(res) => stream::once(async move { res }).boxed(),
            Self::Future(fut) => stream::once(fut)
                .filter_map(|res| async move {
                    match res {
                        Ok(outcome) => outcome.into_value().map(Ok),
                        Err(err) => Some(Err(err)),
                    }
                })
                .boxed(),
            Self::Stream(stream) => stream,
        }
    }
}

impl<T> From<CommandResult<T>> for HandlerOutput<T> {
    fn from(value: CommandResult<T>) -> Self {
        Self::Ready(value)
    }
}

impl<T> core::fmt::Debug for HandlerOutput<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Ready(Ok(_)) => f.write_str("HandlerOutput::Ready(Ok(..))"),
            Self::Ready(Err(err)) => write!(f, "HandlerOutput::Ready(Err({err}))"),
            Self::Future(_) => f.write_str("HandlerOutput::Future(..)"),
            Self::Stream(_) => f.write_str("HandlerOutput::Stream(..)"),
        }
    }
}

/// Box a closure into a [`Handler`].
pub fn handler<A, T, F>(f: F) -> Handler<A, T>
where
    F: Fn(A, CancelSignal) -> HandlerOutput<T> + Send + Sync + 'static,
{
    Arc::new(f)
}
