//! Form-gated save action.

use std::sync::Arc;

use reflex_core::CommandError;

use crate::command::Command;
use crate::context::CommandContext;
use crate::handler::{Handler, HandlerOutput, handler};
use crate::options::{CommandOptions, ConcurrencyPolicy, ConcurrentTriggerBehavior};

/// The validity side of a form.
pub trait FormGroup: Send + Sync {
    fn is_valid(&self) -> bool;

    /// Reveal every validation message. Called when a save is refused.
    fn mark_all_as_touched(&self) {}

    /// Reported as [`CommandError::InvalidForm`].
    fn validation_message(&self) -> String {
        "validation failed".to_string()
    }
}

/// Where the form to check comes from.
pub enum FormSource<A> {
    Static(Arc<dyn FormGroup>),
    FromArgs(Arc<dyn Fn(&A) -> Arc<dyn FormGroup> + Send + Sync>),
}

impl<A> Clone for FormSource<A> {
    fn clone(&self) -> Self {
        match self {
            Self::Static(form) => Self::Static(form.clone()),
            Self::FromArgs(resolve) => Self::FromArgs(resolve.clone()),
        }
    }
}

impl<A> FormSource<A> {
    fn resolve(&self, args: &A) -> Arc<dyn FormGroup> {
        match self {
            Self::Static(form) => form.clone(),
            Self::FromArgs(resolve) => resolve(args),
        }
    }
}

/// Action that only runs `save` while the form is valid.
pub fn save_action<A, T>(
    context: &CommandContext,
    form: FormSource<A>,
    save: Handler<A, T>,
    options: CommandOptions,
) -> Command<A, T>
where
    A: Clone + PartialEq + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    let gated = handler(move |args: A, signal| {
        let form = form.resolve(&args);
        if !form.is_valid() {
            form.mark_all_as_touched();
            return HandlerOutput::error(CommandError::invalid_form(form.validation_message()));
        }
        save(args, signal)
    });

    let options =
        options.with_concurrent_trigger_behavior(ConcurrentTriggerBehavior::new(ConcurrencyPolicy::Ignore));
    Command::new(context, gated, options)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::options::TriggerOptions;

    #[derive(Default)]
    struct TestForm {
        valid: AtomicBool,
        touched: AtomicUsize,
    }

    impl FormGroup for TestForm {
        fn is_valid(&self) -> bool {
            self.valid.load(Ordering::SeqCst)
        }

        fn mark_all_as_touched(&self) {
            self.touched.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn invalid_form_fails_without_saving() {
        let ctx = CommandContext::current().unwrap();
        let form = Arc::new(TestForm::default());
        let saves = Arc::new(AtomicUsize::new(0));
        let cmd = save_action(
            &ctx,
            FormSource::Static(form.clone()),
            {
                let saves = saves.clone();
                handler(move |_: (), _| {
                    saves.fetch_add(1, Ordering::SeqCst);
                    HandlerOutput::value("saved")
                })
            },
            CommandOptions::default(),
        );

        let err = cmd.trigger_async((), TriggerOptions::default()).await.unwrap_err();
        assert!(matches!(err, CommandError::InvalidForm(_)));
        assert_eq!(saves.load(Ordering::SeqCst), 0);
        assert_eq!(form.touched.load(Ordering::SeqCst), 1);

        form.valid.store(true, Ordering::SeqCst);
        let saved = cmd.trigger_async((), TriggerOptions::default()).await.unwrap();
        assert_eq!(saved.into_value(), Some("saved"));
        assert_eq!(saves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn form_can_be_picked_per_trigger() {
        let ctx = CommandContext::current().unwrap();
        let valid: Arc<dyn FormGroup> = Arc::new(TestForm {
            valid: AtomicBool::new(true),
            ..TestForm::default()
        });
        let invalid: Arc<dyn FormGroup> = Arc::new(TestForm::default());
        let cmd = save_action(
            &ctx,
            FormSource::FromArgs(Arc::new(move |id: &u32| {
                if *id == 1 { valid.clone() } else { invalid.clone() }
            })),
            handler(|id: u32, _| HandlerOutput::value(id)),
            CommandOptions::default(),
        );

        assert!(cmd.trigger_async(1, TriggerOptions::default()).await.is_ok());
        assert!(cmd.trigger_async(2, TriggerOptions::default()).await.is_err());
    }
}
