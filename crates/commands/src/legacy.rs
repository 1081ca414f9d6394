//! Bridge for command objects that only expose a boolean `trigger` and
//! separate result/error/completion streams.

use futures::StreamExt;
use futures::future::{self, BoxFuture};
use futures::stream::BoxStream;

use reflex_core::{CommandError, CommandResult};

use crate::handler::Outcome;

/// Older command shape.
pub trait LegacyCommand<A, T>: Send + Sync
where
    A: Send + 'static,
    T: Send + 'static,
{
    /// Start an invocation. `false` means nothing was started.
    fn trigger(&self, args: A) -> bool;

    fn results(&self) -> BoxStream<'static, T>;

    fn errors(&self) -> BoxStream<'static, CommandError>;

    fn completions(&self) -> BoxStream<'static, ()>;

    /// Trigger and wait for the first result, error or completion.
    ///
    /// Implementations with a native async trigger should override this.
    fn trigger_async(&self, args: A) -> BoxFuture<'static, CommandResult<Outcome<T>>> {
        bridge(self, args)
    }
}

enum First<T> {
    Result(T),
    Error(CommandError),
    Completed,
}

/// Subscribes before triggering so a synchronous legacy command cannot emit
/// before anyone listens.
fn bridge<A, T, L>(legacy: &L, args: A) -> BoxFuture<'static, CommandResult<Outcome<T>>>
where
    A: Send + 'static,
    T: Send + 'static,
    L: LegacyCommand<A, T> + ?Sized,
{
    let mut results = legacy.results();
    let mut errors = legacy.errors();
    let mut completions = legacy.completions();

    if !legacy.trigger(args) {
        return Box::pin(future::ready(Ok(Outcome::Aborted)));
    }

    Box::pin(async move {
        let first = tokio::select! {
            biased;
            Some(value) = results.next() => First::Result(value),
            Some(err) = errors.next() => First::Error(err),
            _ = completions.next() => First::Completed,
        };
        match first {
            First::Result(value) => Ok(Outcome::Completed(Some(value))),
            First::Error(err) => Err(err),
            First::Completed => Ok(Outcome::Completed(None)),
        }
    })
}
