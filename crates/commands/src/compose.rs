//! Deriving commands from whatever the caller has at hand.
//!
//! [`CommandInput`] names every shape a command can be made from. It is
//! resolved once, when the derived command is built.

use std::sync::Arc;

use async_trait::async_trait;

use reflex_core::CommandResult;

use crate::command::Command;
use crate::context::CommandContext;
use crate::handler::{Handler, HandlerOutput, Outcome, handler};
use crate::legacy::LegacyCommand;
use crate::options::{CommandOptions, StatusOptions, TriggerOptions};

/// Anything that behaves like a command.
#[async_trait]
pub trait AbstractCommand<A, T>: Send + Sync
where
    A: Send + 'static,
    T: Send + 'static,
{
    async fn trigger_async(&self, args: A, options: TriggerOptions) -> CommandResult<Outcome<T>>;

    /// Status options a wrapper merges its own over.
    fn status_options(&self) -> StatusOptions {
        StatusOptions::default()
    }
}

#[async_trait]
impl<A, T> AbstractCommand<A, T> for Command<A, T>
where
    A: Clone + PartialEq + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    async fn trigger_async(&self, args: A, options: TriggerOptions) -> CommandResult<Outcome<T>> {
        Command::trigger_async(self, args, options).await
    }

    fn status_options(&self) -> StatusOptions {
        self.options().status.clone()
    }
}

/// The shapes a command can be derived from.
pub enum CommandInput<A, T> {
    Native(Command<A, T>),
    Abstract(Arc<dyn AbstractCommand<A, T>>),
    Legacy(Arc<dyn LegacyCommand<A, T>>),
    Callable(Handler<A, T>),
}

impl<A, T> Clone for CommandInput<A, T> {
    fn clone(&self) -> Self {
        match self {
            Self::Native(command) => Self::Native(command.clone()),
            Self::Abstract(command) => Self::Abstract(command.clone()),
            Self::Legacy(command) => Self::Legacy(command.clone()),
            Self::Callable(handler) => Self::Callable(handler.clone()),
        }
    }
}

impl<A, T> core::fmt::Debug for CommandInput<A, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let kind = match self {
            Self::Native(_) => "Native",
            Self::Abstract(_) => "Abstract",
            Self::Legacy(_) => "Legacy",
            Self::Callable(_) => "Callable",
        };
        write!(f, "CommandInput::{kind}(..)")
    }
}

impl<A, T> From<Command<A, T>> for CommandInput<A, T> {
    fn from(command: Command<A, T>) -> Self {
        Self::Native(command)
    }
}

/// Handler forwarding to `inner` without reporting status twice.
fn delegate<A, T>(inner: Arc<dyn AbstractCommand<A, T>>) -> Handler<A, T>
where
    A: Send + 'static,
    T: Send + 'static,
{
    handler(move |args, signal| {
        let inner = inner.clone();
        HandlerOutput::deferred(async move {
            let options = TriggerOptions::default().suppress_status().with_signal(signal);
            inner.trigger_async(args, options).await
        })
    })
}

fn into_handler<A, T>(input: CommandInput<A, T>, options: &mut CommandOptions) -> Handler<A, T>
where
    A: Clone + PartialEq + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    let wrapped: Arc<dyn AbstractCommand<A, T>> = match input {
        CommandInput::Native(command) => Arc::new(command),
        CommandInput::Abstract(command) => command,
        CommandInput::Legacy(legacy) => {
            return handler(move |args, _signal| HandlerOutput::deferred(legacy.trigger_async(args)));
        }
        CommandInput::Callable(handler) => return handler,
    };

    options.status = wrapped.status_options().merge(&options.status);
    delegate(wrapped)
}

/// Normalize `input` into a [`Command`].
///
/// A native command without extra options is returned as is.
pub fn from_input<A, T>(
    context: &CommandContext,
    input: CommandInput<A, T>,
    options: Option<CommandOptions>,
) -> Command<A, T>
where
    A: Clone + PartialEq + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    if let (CommandInput::Native(command), None) = (&input, &options) {
        return command.clone();
    }

    let mut options = options.unwrap_or_default();
    let handler = into_handler(input, &mut options);
    Command::new(context, handler, options)
}

/// Like [`from_input`], but the derived command takes `B` and converts it
/// with `map` before delegating.
pub fn from_input_mapped<A, B, T, F>(
    context: &CommandContext,
    input: CommandInput<A, T>,
    map: F,
    options: Option<CommandOptions>,
) -> Command<B, T>
where
    A: Clone + PartialEq + Send + Sync + 'static,
    B: Clone + PartialEq + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    F: Fn(B) -> A + Send + Sync + 'static,
{
    let mut options = options.unwrap_or_default();
    let inner = into_handler(input, &mut options);
    let mapped = handler(move |args: B, signal| inner(map(args), signal));
    Command::new(context, mapped, options)
}
