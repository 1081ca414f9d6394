//! Data queries: cancellable commands that (re)load a result.

use std::sync::{Arc, Mutex, PoisonError};

use futures::stream::{self, Stream, StreamExt};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use reflex_core::{CancelSignal, CommandId};
use reflex_events::CommandEvent;

use crate::command::Command;
use crate::context::CommandContext;
use crate::handler::{Handler, HandlerOutput, Outcome};
use crate::options::{CommandOptions, ConcurrencyPolicy, ConcurrentTriggerBehavior, TriggerOptions};

fn manual_options(options: CommandOptions) -> CommandOptions {
    options
        .cancellable(true)
        .with_concurrent_trigger_behavior(ConcurrentTriggerBehavior::new(ConcurrencyPolicy::Ignore))
}

fn reactive_options(options: CommandOptions) -> CommandOptions {
    options.cancellable(true).with_concurrent_trigger_behavior(
        ConcurrentTriggerBehavior::new(ConcurrencyPolicy::CancelRunning).only_when_params_changed(),
    )
}

/// Query that only runs when triggered.
pub fn query<A, T>(context: &CommandContext, handler: Handler<A, T>, options: CommandOptions) -> Command<A, T>
where
    A: Clone + PartialEq + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    Command::new(context, handler, manual_options(options))
}

/// Query triggered once, immediately, with `args`.
pub fn auto_query<A, T>(
    context: &CommandContext,
    handler: Handler<A, T>,
    args: A,
    options: CommandOptions,
) -> Command<A, T>
where
    A: Clone + PartialEq + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    let command = query(context, handler, options);
    command.trigger(args);
    command
}

/// Query re-triggered whenever `args` changes to `Some`.
///
/// The current value counts as a change. While it is `None` nothing runs.
pub fn query_from_signal<A, T>(
    context: &CommandContext,
    args: watch::Receiver<Option<A>>,
    handler: Handler<A, T>,
    options: CommandOptions,
) -> Command<A, T>
where
    A: Clone + PartialEq + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    query_from_stream(context, WatchStream::new(args), handler, options)
}

/// Query re-triggered with every `Some` item of `args`.
///
/// Listening stops when the stream ends, the command is dropped or the
/// context is disposed.
pub fn query_from_stream<A, T, S>(
    context: &CommandContext,
    args: S,
    handler: Handler<A, T>,
    options: CommandOptions,
) -> Command<A, T>
where
    A: Clone + PartialEq + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    S: Stream<Item = Option<A>> + Send + 'static,
{
    let command = Command::new(context, handler, reactive_options(options));
    let weak = command.downgrade();

    context.spawn_scoped(async move {
        let mut args = Box::pin(args);
        while let Some(next) = args.next().await {
            let Some(command) = weak.upgrade() else { break };
            if let Some(next) = next {
                command.trigger(next);
            }
        }
    });
    command
}

/// Query fed by another command's results.
///
/// Runs with the source's current result (if any) and then with every result
/// the source produces. Busy while either command is busy.
pub fn query_from_source<S, R, T>(
    context: &CommandContext,
    source: &Command<S, R>,
    handler: Handler<R, T>,
    options: CommandOptions,
) -> Command<R, T>
where
    S: Clone + PartialEq + Send + Sync + 'static,
    R: Clone + PartialEq + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    let later = source.results();
    let current = source.result();
    let args = stream::iter(current).chain(later).map(Some);

    let command = query_from_stream(context, args, handler, options);
    command.link_busy(source.busy_watch());
    command
}

/// Query that pulls its input through `source`.
///
/// Triggering it triggers `source` with the same args and hands the source's
/// result to `handler`. When someone else triggers `source`, this query runs
/// on the produced result without triggering `source` again, as long as it is
/// not already running. Busy while either command is busy.
pub fn query_interdependent<A, R, T>(
    context: &CommandContext,
    source: &Command<A, R>,
    handler: Handler<R, T>,
    options: CommandOptions,
) -> Command<A, T>
where
    A: Clone + PartialEq + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    let id = CommandId::new();
    let handed_over: Arc<Mutex<Option<R>>> = Arc::default();

    let pull = {
        let source = source.clone();
        let handed_over = handed_over.clone();
        crate::handler::handler(move |args: A, signal: CancelSignal| {
            let ready = handed_over
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(input) = ready {
                return handler(input, signal);
            }

            let fetched = source.trigger_async(
                args,
                TriggerOptions::default()
                    .with_origin(id)
                    .with_signal(signal.clone()),
            );
            let handler = handler.clone();
            let outputs = stream::once(fetched)
                .map(move |fetched| match fetched {
                    Ok(Outcome::Completed(Some(input))) => handler(input, signal.clone()).into_stream(),
                    Ok(_) => stream::empty().boxed(),
                    Err(err) => stream::once(async move { Err(err) }).boxed(),
                })
                .flatten();
            HandlerOutput::stream(outputs)
        })
    };

    let command = Command::with_id(id, context, pull, reactive_options(options));
    command.link_busy(source.busy_watch());

    let weak = command.downgrade();
    let mut events = source.subscribe();
    context.spawn_scoped(async move {
        // args and origin of the source invocation in flight
        let mut current: Option<(u64, A, Option<CommandId>)> = None;

        while let Some(envelope) = events.recv().await {
            let invocation = envelope.invocation();
            match envelope.into_payload() {
                CommandEvent::Triggered { args, origin } => current = Some((invocation, args, origin)),
                CommandEvent::Result(value) => {
                    let Some((_, args, _)) = current
                        .as_ref()
                        .filter(|(running, _, origin)| *running == invocation && *origin != Some(id))
                    else {
                        continue;
                    };
                    let Some(command) = weak.upgrade() else { break };
                    if command.is_running() {
                        continue;
                    }

                    *handed_over.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
                    command.trigger(args.clone());
                    // consumed by the handler unless the trigger was vetoed
                    handed_over.lock().unwrap_or_else(PoisonError::into_inner).take();
                }
                CommandEvent::Completed(_) => {
                    if current.as_ref().is_some_and(|(running, _, _)| *running == invocation) {
                        current = None;
                    }
                }
                CommandEvent::Busy(_) | CommandEvent::Error(_) => {}
            }
        }
    });
    command
}
