//! Commands derived from reactive inputs.

use std::sync::{Mutex, PoisonError};

use tokio::sync::watch;

use crate::command::Command;
use crate::compose::{CommandInput, from_input};
use crate::context::CommandContext;
use crate::options::CommandOptions;

struct Tracked<A, T> {
    input: watch::Receiver<CommandInput<A, T>>,
    options: Option<watch::Receiver<Option<CommandOptions>>>,
    current: Option<Command<A, T>>,
}

/// Reactive accessor for a command re-derived whenever its input or options
/// change.
pub struct CommandSignal<A, T> {
    context: CommandContext,
    tracked: Mutex<Tracked<A, T>>,
}

impl<A, T> core::fmt::Debug for CommandSignal<A, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandSignal").finish_non_exhaustive()
    }
}

/// Derive a command from `input` (and optional `options`) lazily.
pub fn from_input_signal<A, T>(
    context: &CommandContext,
    input: watch::Receiver<CommandInput<A, T>>,
    options: Option<watch::Receiver<Option<CommandOptions>>>,
) -> CommandSignal<A, T> {
    CommandSignal {
        context: context.clone(),
        tracked: Mutex::new(Tracked {
            input,
            options,
            current: None,
        }),
    }
}

impl<A, T> CommandSignal<A, T>
where
    A: Clone + PartialEq + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// The command for the latest input, derived on first access after a
    /// change.
    pub fn get(&self) -> Command<A, T> {
        let mut tracked = self.tracked.lock().unwrap_or_else(PoisonError::into_inner);

        let input_changed = tracked.input.has_changed().unwrap_or(false);
        let options_changed = tracked
            .options
            .as_ref()
            .is_some_and(|rx| rx.has_changed().unwrap_or(false));
        if let Some(current) = &tracked.current {
            if !input_changed && !options_changed {
                return current.clone();
            }
        }

        let input = tracked.input.borrow_and_update().clone();
        let options = tracked
            .options
            .as_mut()
            .and_then(|rx| rx.borrow_and_update().clone());
        let command = from_input(&self.context, input, options);
        tracing::debug!(command = %command.id(), "derived command from input");
        tracked.current = Some(command.clone());
        command
    }

    /// Resolves when the input or the options change.
    ///
    /// A closed watch no longer counts as a change; once both are closed
    /// this never resolves.
    pub async fn changed(&self) {
        let (mut input, mut options) = {
            let tracked = self.tracked.lock().unwrap_or_else(PoisonError::into_inner);
            (tracked.input.clone(), tracked.options.clone())
        };

        tokio::select! {
            Ok(()) = input.changed() => {}
            Ok(()) = options_changed(options.as_mut()) => {}
            else => std::future::pending::<()>().await,
        }
    }
}

async fn options_changed(
    options: Option<&mut watch::Receiver<Option<CommandOptions>>>,
) -> Result<(), watch::error::RecvError> {
    match options {
        Some(options) => options.changed().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::handler::{HandlerOutput, handler};
    use crate::options::{ConcurrencyPolicy, TriggerOptions};

    fn callable(offset: u32) -> CommandInput<u32, u32> {
        CommandInput::Callable(handler(move |n: u32, _| HandlerOutput::value(n + offset)))
    }

    #[tokio::test]
    async fn command_is_reused_until_input_changes() {
        let ctx = CommandContext::current().unwrap();
        let (tx, rx) = watch::channel(callable(1));
        let signal = from_input_signal(&ctx, rx, None);

        let first = signal.get();
        assert!(signal.get().ptr_eq(&first));
        first.trigger(1);
        assert_eq!(first.result(), Some(2));

        tx.send_replace(callable(10));
        let second = signal.get();
        assert!(!second.ptr_eq(&first));
        let outcome = second.trigger_async(1, TriggerOptions::default()).await.unwrap();
        assert_eq!(outcome.into_value(), Some(11));
    }

    #[tokio::test]
    async fn options_change_rederives() {
        let ctx = CommandContext::current().unwrap();
        let (_input_tx, input_rx) = watch::channel(callable(0));
        let (options_tx, options_rx) = watch::channel(None);
        let signal = from_input_signal(&ctx, input_rx, Some(options_rx));

        let first = signal.get();
        assert_eq!(first.options().concurrent_trigger_behavior.policy, ConcurrencyPolicy::Ignore);

        let waiter = signal.changed();
        options_tx.send_replace(Some(
            CommandOptions::default().with_policy(ConcurrencyPolicy::WaitForRunning),
        ));
        waiter.await;

        let second = signal.get();
        assert_eq!(
            second.options().concurrent_trigger_behavior.policy,
            ConcurrencyPolicy::WaitForRunning
        );
    }

    #[tokio::test]
    async fn closed_options_watch_is_not_a_change() {
        let ctx = CommandContext::current().unwrap();
        let (input_tx, input_rx) = watch::channel(callable(0));
        let (options_tx, options_rx) = watch::channel(None);
        let signal = from_input_signal(&ctx, input_rx, Some(options_rx));
        drop(options_tx);

        let early = tokio::time::timeout(Duration::from_millis(20), signal.changed()).await;
        assert!(early.is_err());

        let waiter = signal.changed();
        input_tx.send_replace(callable(5));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("input change is reported");
    }
}
