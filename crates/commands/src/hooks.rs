//! Before/after execution hooks.
//!
//! Hooks are kept as an ordered list on the command. Before-execute hooks run
//! newest first and stop at the first veto; after-execute hooks run oldest
//! first and always all run.

use std::sync::Arc;

use reflex_core::{CommandError, CommandResult};

/// Gate run right before the handler. `Ok(false)` vetoes the trigger.
pub type BeforeExecuteHook<A> = Arc<dyn Fn(&A) -> CommandResult<bool> + Send + Sync>;

/// Hook run after every invocation, whatever its outcome.
pub type AfterExecuteHook<A, T> = Arc<dyn Fn(&AfterExecute<A, T>) -> CommandResult<()> + Send + Sync>;

/// What an after-execute hook gets to see.
#[derive(Debug, Clone)]
pub struct AfterExecute<A, T> {
    pub args: A,
    /// Set when the invocation succeeded with a value.
    pub result: Option<T>,
    /// Set when the invocation failed.
    pub error: Option<CommandError>,
}

pub(crate) struct Hooks<A, T> {
    before: Vec<BeforeExecuteHook<A>>,
    after: Vec<AfterExecuteHook<A, T>>,
}

impl<A, T> Default for Hooks<A, T> {
    fn default() -> Self {
        Self {
            before: Vec::new(),
            after: Vec::new(),
        }
    }
}

impl<A, T> Clone for Hooks<A, T> {
    fn clone(&self) -> Self {
        Self {
            before: self.before.clone(),
            after: self.after.clone(),
        }
    }
}

impl<A, T> Hooks<A, T> {
    pub(crate) fn push_before(&mut self, hook: BeforeExecuteHook<A>) {
        self.before.push(hook);
    }

    pub(crate) fn push_after(&mut self, hook: AfterExecuteHook<A, T>) {
        self.after.push(hook);
    }

    pub(crate) fn run_before(&self, args: &A) -> CommandResult<bool> {
        for hook in self.before.iter().rev() {
            if !hook(args)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Runs every after hook and returns the failures in hook order.
    pub(crate) fn run_after(&self, report: &AfterExecute<A, T>) -> Vec<CommandError> {
        self.after
            .iter()
            .filter_map(|hook| hook(report).err())
            .collect()
    }
}
