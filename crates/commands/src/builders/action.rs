use crate::command::Command;
use crate::context::CommandContext;
use crate::handler::Handler;
use crate::options::{CommandOptions, ConcurrencyPolicy, ConcurrentTriggerBehavior};

/// One-shot user action. Triggers while busy are ignored.
pub fn action<A, T>(context: &CommandContext, handler: Handler<A, T>, options: CommandOptions) -> Command<A, T>
where
    A: Clone + PartialEq + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    let options =
        options.with_concurrent_trigger_behavior(ConcurrentTriggerBehavior::new(ConcurrencyPolicy::Ignore));
    Command::new(context, handler, options)
}

/// Work that starts on its own, right away, with `args`.
///
/// Later triggers queue behind the running one. Progress is not shown, but
/// failures are still reported.
pub fn background<A, T>(
    context: &CommandContext,
    handler: Handler<A, T>,
    args: A,
    options: CommandOptions,
) -> Command<A, T>
where
    A: Clone + PartialEq + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    let mut options = options.with_concurrent_trigger_behavior(ConcurrentTriggerBehavior::new(
        ConcurrencyPolicy::WaitForRunning,
    ));
    options.status.show_busy = Some(false);

    let command = Command::new(context, handler, options);
    command.trigger(args);
    command
}
