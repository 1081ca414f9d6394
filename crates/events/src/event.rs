use reflex_core::{CommandError, CommandId};

/// How an invocation ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CompletionKind {
    /// The handler produced its outcome without error.
    Succeeded,
    /// The handler, or a before-execute hook, failed.
    Failed,
    /// A before-execute hook vetoed the trigger or a delegate aborted.
    Aborted,
    /// The invocation was torn down by `cancel()`.
    Cancelled,
}

/// Lifecycle event of a command.
///
/// Per invocation the order is always: `Triggered`, then (unless a
/// before-execute hook stops it) `Busy(true)`, any number of `Result`s, at
/// most one `Error` from the handler, `Busy(false)`, after-hook `Error`s, and
/// finally exactly one `Completed`.
#[derive(Debug, Clone)]
pub enum CommandEvent<A, T> {
    Triggered {
        args: A,
        /// Command that caused this trigger, if it was triggered on another
        /// command's behalf.
        origin: Option<CommandId>,
    },
    Busy(bool),
    Result(T),
    Error(CommandError),
    Completed(CompletionKind),
}

impl<A, T> CommandEvent<A, T> {
    /// Stable event name (e.g. for logs).
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Triggered { .. } => "command.triggered",
            Self::Busy(_) => "command.busy",
            Self::Result(_) => "command.result",
            Self::Error(_) => "command.error",
            Self::Completed(_) => "command.completed",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}
