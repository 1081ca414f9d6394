//! The command state machine.
//!
//! A [`Command`] wraps one handler and owns its lifecycle: at most one
//! invocation runs at a time, concurrent triggers are arbitrated by the
//! configured [`ConcurrencyPolicy`], and every transition is published on the
//! command's [`ResultChannel`].
//!
//! Arbitration happens synchronously inside `trigger`/`trigger_async`, so a
//! handler returning [`HandlerOutput::Ready`] has finished (and `result()` is
//! set) by the time the trigger call returns. Futures and streams are driven
//! on the context runtime.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use futures::StreamExt;
use futures::future::{self, BoxFuture};
use futures::stream::BoxStream;
use tokio::sync::{oneshot, watch};
use tokio_stream::wrappers::WatchStream;
use tracing::{Instrument, debug, warn};

use reflex_core::{CancelController, CancelSignal, CommandError, CommandId, CommandResult};
use reflex_events::{
    BusySubscription, CommandEnvelope, CommandEvent, CompletionKind, ResultChannel, Subscription,
};

use crate::context::CommandContext;
use crate::handler::{Handler, HandlerOutput, Outcome};
use crate::hooks::{AfterExecute, Hooks};
use crate::options::{CommandOptions, ConcurrencyPolicy, TriggerOptions, WhenNotTriggered};
use crate::status::StatusRegistration;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Phase {
    /// Claimed, before-execute hooks running.
    Preparing,
    /// Handler in flight.
    Busy,
    /// Busy cleared, after-execute hooks running.
    Finishing,
}

struct Running<A> {
    invocation: u64,
    args: A,
    phase: Phase,
    handler_cancel: CancelController,
    observe_cancel: CancelController,
}

struct State<A, T> {
    result: Option<T>,
    error: Option<CommandError>,
    running: Option<Running<A>>,
    next_invocation: u64,
    /// Most recent queued trigger; older tickets are superseded.
    pending_ticket: u64,
}

impl<A, T> Default for State<A, T> {
    fn default() -> Self {
        Self {
            result: None,
            error: None,
            running: None,
            next_invocation: 0,
            pending_ticket: 0,
        }
    }
}

struct Inner<A, T> {
    id: CommandId,
    options: CommandOptions,
    handler: Handler<A, T>,
    hooks: RwLock<Hooks<A, T>>,
    channel: ResultChannel<A, T>,
    state: Mutex<State<A, T>>,
    /// Number of the last invocation that finished.
    finished: watch::Sender<u64>,
    linked_busy: RwLock<Vec<watch::Receiver<bool>>>,
    any_busy: watch::Sender<bool>,
    context: CommandContext,
}

/// Handle to a command. Clones share the same lifecycle.
pub struct Command<A, T> {
    inner: Arc<Inner<A, T>>,
}

impl<A, T> Clone for Command<A, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A, T> core::fmt::Debug for Command<A, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.inner.id)
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

/// Non-owning handle for listeners that must not keep a command alive.
pub(crate) struct WeakCommand<A, T> {
    inner: Weak<Inner<A, T>>,
}

impl<A, T> WeakCommand<A, T> {
    pub(crate) fn upgrade(&self) -> Option<Command<A, T>> {
        self.inner.upgrade().map(|inner| Command { inner })
    }
}

/// Outcome of arbitration, decided synchronously.
enum Step<A, T> {
    Done(CommandResult<Outcome<T>>),
    Running(oneshot::Receiver<CommandResult<Outcome<T>>>),
    Queued(Queued<A>),
}

struct Queued<A> {
    ticket: u64,
    awaiting: u64,
    args: A,
    options: TriggerOptions,
}

enum Arbitration<A, T> {
    Start(Claim<A, T>),
    Done(CommandResult<Outcome<T>>),
    Queue { ticket: u64, awaiting: u64 },
    CancelRunning,
}

struct Claim<A, T> {
    invocation: u64,
    args: A,
    handler_cancel: CancelController,
    observe_cancel: CancelController,
    status: Option<Subscription<CommandEnvelope<A, T>>>,
}

enum Settlement<T> {
    Succeeded(Option<T>),
    Failed(CommandError),
    Aborted,
}

enum Next<T> {
    Cancelled,
    Item(Option<CommandResult<T>>),
}

async fn external_cancelled(signal: Option<CancelSignal>) {
    match signal {
        Some(signal) => signal.cancelled().await,
        None => std::future::pending().await,
    }
}

impl<A, T> Command<A, T>
where
    A: Clone + PartialEq + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new(context: &CommandContext, handler: Handler<A, T>, options: CommandOptions) -> Self {
        Self::with_id(CommandId::new(), context, handler, options)
    }

    /// Build with a pre-allocated id (for commands whose handler refers to
    /// their own id).
    pub fn with_id(
        id: CommandId,
        context: &CommandContext,
        handler: Handler<A, T>,
        options: CommandOptions,
    ) -> Self {
        let (finished, _) = watch::channel(0);
        let (any_busy, _) = watch::channel(false);
        debug!(command = %id, policy = ?options.concurrent_trigger_behavior.policy, "command created");

        Self {
            inner: Arc::new(Inner {
                id,
                options,
                handler,
                hooks: RwLock::new(Hooks::default()),
                channel: ResultChannel::new(id, context.config().channel_capacity),
                state: Mutex::new(State::default()),
                finished,
                linked_busy: RwLock::new(Vec::new()),
                any_busy,
                context: context.clone(),
            }),
        }
    }

    pub fn id(&self) -> CommandId {
        self.inner.id
    }

    pub fn options(&self) -> &CommandOptions {
        &self.inner.options
    }

    pub fn context(&self) -> &CommandContext {
        &self.inner.context
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade(&self) -> WeakCommand<A, T> {
        WeakCommand {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<A, T>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn hooks(&self) -> Hooks<A, T> {
        self.inner
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Last value produced by a successful emission.
    pub fn result(&self) -> Option<T> {
        self.lock().result.clone()
    }

    /// Failure of the latest invocation, cleared on every new trigger.
    pub fn error(&self) -> Option<CommandError> {
        self.lock().error.clone()
    }

    /// `true` while this command or any linked command is busy.
    pub fn is_busy(&self) -> bool {
        self.inner.channel.is_busy()
            || self
                .inner
                .linked_busy
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .any(|rx| *rx.borrow())
    }

    /// `true` while an invocation of this command is in flight.
    pub fn is_running(&self) -> bool {
        self.lock().running.is_some()
    }

    fn is_linked(&self) -> bool {
        !self
            .inner
            .linked_busy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Latest combined busy value (own busy OR linked commands' busy).
    pub fn busy_watch(&self) -> watch::Receiver<bool> {
        if self.is_linked() {
            self.inner.any_busy.subscribe()
        } else {
            self.inner.channel.busy_watch()
        }
    }

    /// Own busy value followed by every own transition, uncoalesced.
    ///
    /// Linked commands are not included; see [`busy_changes`](Self::busy_changes).
    pub fn subscribe_busy(&self) -> BusySubscription<A, T> {
        self.inner.channel.subscribe_busy()
    }

    /// Combined busy value (the same answer as [`is_busy`](Self::is_busy))
    /// followed by its changes.
    ///
    /// Without linked commands this is every own transition. With linked
    /// commands, changes are merged on the runtime and fast flips may
    /// coalesce.
    pub fn busy_changes(&self) -> BoxStream<'static, bool> {
        if self.is_linked() {
            self.refresh_busy();
            WatchStream::new(self.inner.any_busy.subscribe()).boxed()
        } else {
            self.inner.channel.busy_changes()
        }
    }

    pub fn subscribe(&self) -> Subscription<CommandEnvelope<A, T>> {
        self.inner.channel.subscribe()
    }

    pub fn events(&self) -> BoxStream<'static, CommandEnvelope<A, T>> {
        self.inner.channel.events()
    }

    pub fn results(&self) -> BoxStream<'static, T> {
        self.inner.channel.results()
    }

    pub fn errors(&self) -> BoxStream<'static, CommandError> {
        self.inner.channel.errors()
    }

    pub fn completions(&self) -> BoxStream<'static, CompletionKind> {
        self.inner.channel.completions()
    }

    pub fn triggers(&self) -> BoxStream<'static, A> {
        self.inner.channel.triggers()
    }

    /// Gate run before the handler. The most recently added gate runs first;
    /// the first `Ok(false)` aborts the trigger.
    pub fn add_before_execute_hook<F>(&self, hook: F)
    where
        F: Fn(&A) -> CommandResult<bool> + Send + Sync + 'static,
    {
        self.inner
            .hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push_before(Arc::new(hook));
    }

    /// Hook run after every invocation, in the order hooks were added.
    pub fn add_after_execute_hook<F>(&self, hook: F)
    where
        F: Fn(&AfterExecute<A, T>) -> CommandResult<()> + Send + Sync + 'static,
    {
        self.inner
            .hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push_after(Arc::new(hook));
    }

    /// Make `other` count towards this command's busy state.
    pub(crate) fn link_busy(&self, other: watch::Receiver<bool>) {
        self.inner
            .linked_busy
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(other.clone());
        self.refresh_busy();

        let weak = self.downgrade();
        let mut own = self.inner.channel.busy_watch();
        let mut other = other;
        self.inner.context.spawn_scoped(async move {
            loop {
                let alive = tokio::select! {
                    res = own.changed() => res.is_ok(),
                    res = other.changed() => res.is_ok(),
                };
                let Some(command) = weak.upgrade() else { break };
                command.refresh_busy();
                if !alive {
                    break;
                }
            }
        });
    }

    fn refresh_busy(&self) {
        let busy = self.is_busy();
        self.inner.any_busy.send_if_modified(|current| {
            let changed = *current != busy;
            *current = busy;
            changed
        });
    }

    /// Fire and forget. Failures only reach the error stream.
    pub fn trigger(&self, args: A) {
        self.trigger_with(args, TriggerOptions::default());
    }

    pub fn trigger_with(&self, args: A, options: TriggerOptions) {
        match self.begin(args, options) {
            Step::Done(Err(err)) => {
                debug!(command = %self.id(), error = %err, "trigger rejected");
            }
            Step::Done(Ok(_)) | Step::Running(_) => {}
            step @ Step::Queued(_) => {
                self.spawn_queued(step);
            }
        }
    }

    /// Trigger and observe the outcome.
    ///
    /// Arbitration happens when this is called, not when the future is first
    /// polled. Dropping the future does not withdraw the trigger: a queued
    /// trigger is driven on the context runtime either way. Resolves with the
    /// handler's final value, `Outcome::Aborted` when nothing ran (or the
    /// invocation was cancelled), or the failure.
    pub fn trigger_async(
        &self,
        args: A,
        options: TriggerOptions,
    ) -> BoxFuture<'static, CommandResult<Outcome<T>>> {
        let rx = match self.begin(args, options) {
            Step::Done(outcome) => return Box::pin(future::ready(outcome)),
            Step::Running(rx) => rx,
            step @ Step::Queued(_) => self.spawn_queued(step),
        };
        // driver gone without answering: the runtime shut down
        Box::pin(async move { rx.await.unwrap_or(Ok(Outcome::Aborted)) })
    }

    fn spawn_queued(&self, step: Step<A, T>) -> oneshot::Receiver<CommandResult<Outcome<T>>> {
        let (tx, rx) = oneshot::channel();
        let this = self.clone();
        self.inner.context.spawn(async move {
            let outcome = this.drive(step).await;
            if let Err(err) = &outcome {
                debug!(command = %this.id(), error = %err, "queued trigger failed");
            }
            let _ = tx.send(outcome);
        });
        rx
    }

    /// Tear down the in-flight invocation. Returns `false` if nothing was
    /// running.
    pub fn cancel(&self) -> bool {
        let (invocation, args, handler_cancel, observe_cancel) = {
            let mut state = self.lock();
            let Some(running) = state.running.as_mut() else {
                return false;
            };
            if running.phase != Phase::Busy {
                return false;
            }
            running.phase = Phase::Finishing;
            let torn_down = (
                running.invocation,
                running.args.clone(),
                running.handler_cancel.clone(),
                running.observe_cancel.clone(),
            );
            self.inner.channel.publish(torn_down.0, CommandEvent::Busy(false));
            torn_down
        };

        debug!(command = %self.id(), invocation, "cancelled");
        if self.inner.options.is_cancellable {
            handler_cancel.cancel();
        }
        observe_cancel.cancel();

        self.run_after_hooks(invocation, args, None, None);
        self.finish(invocation, CompletionKind::Cancelled);
        true
    }

    fn begin(&self, args: A, options: TriggerOptions) -> Step<A, T> {
        if options.signal.as_ref().is_some_and(CancelSignal::is_cancelled) {
            return Step::Done(Ok(Outcome::Aborted));
        }

        loop {
            let arbitration = {
                let mut state = self.lock();
                match &state.running {
                    None => Arbitration::Start(self.claim(&mut state, args.clone(), &options)),
                    Some(running) => {
                        let behavior = self.inner.options.concurrent_trigger_behavior;
                        if behavior.only_when_params_changed && running.args == args {
                            Arbitration::Done(Ok(Outcome::Completed(state.result.clone())))
                        } else {
                            match behavior.policy {
                                ConcurrencyPolicy::Ignore => {
                                    Arbitration::Done(self.not_triggered(&state, &options))
                                }
                                ConcurrencyPolicy::CancelRunning if running.phase == Phase::Busy => {
                                    Arbitration::CancelRunning
                                }
                                ConcurrencyPolicy::WaitForRunning | ConcurrencyPolicy::CancelRunning => {
                                    let awaiting = running.invocation;
                                    state.pending_ticket += 1;
                                    Arbitration::Queue {
                                        ticket: state.pending_ticket,
                                        awaiting,
                                    }
                                }
                            }
                        }
                    }
                }
            };

            match arbitration {
                Arbitration::Start(claim) => return self.start(claim, options),
                Arbitration::Done(outcome) => return Step::Done(outcome),
                Arbitration::Queue { ticket, awaiting } => {
                    return Step::Queued(Queued {
                        ticket,
                        awaiting,
                        args,
                        options,
                    });
                }
                Arbitration::CancelRunning => {
                    self.cancel();
                }
            }
        }
    }

    fn not_triggered(
        &self,
        state: &State<A, T>,
        options: &TriggerOptions,
    ) -> CommandResult<Outcome<T>> {
        let behavior = options
            .when_not_triggered
            .unwrap_or(self.inner.options.when_not_triggered);
        debug!(command = %self.id(), ?behavior, "trigger not run");
        match behavior {
            WhenNotTriggered::ReturnAborted => Ok(Outcome::Aborted),
            WhenNotTriggered::ReturnLastResult => Ok(Outcome::Completed(state.result.clone())),
            WhenNotTriggered::ThrowError => Err(CommandError::AlreadyRunning),
        }
    }


    /// Take the running slot. Called with the state locked.
    fn claim(&self, state: &mut State<A, T>, args: A, options: &TriggerOptions) -> Claim<A, T> {
        state.next_invocation += 1;
        let invocation = state.next_invocation;
        state.error = None;

        let handler_cancel = CancelController::new();
        let observe_cancel = CancelController::new();
        state.running = Some(Running {
            invocation,
            args: args.clone(),
            phase: Phase::Preparing,
            handler_cancel: handler_cancel.clone(),
            observe_cancel: observe_cancel.clone(),
        });

        // subscribed before `Triggered` so the registration sees the whole invocation
        let report_status = !options.suppress_status && self.inner.context.config().status_enabled;
        let status = report_status.then(|| self.inner.channel.subscribe());

        self.inner.channel.publish(
            invocation,
            CommandEvent::Triggered {
                args: args.clone(),
                origin: options.origin,
            },
        );

        Claim {
            invocation,
            args,
            handler_cancel,
            observe_cancel,
            status,
        }
    }

    fn start(&self, claim: Claim<A, T>, options: TriggerOptions) -> Step<A, T> {
        let Claim {
            invocation,
            args,
            handler_cancel,
            observe_cancel,
            status,
        } = claim;

        if let Some(subscription) = status {
            let status_options = match &options.status {
                Some(overrides) => self.inner.options.status.merge(overrides),
                None => self.inner.options.status.clone(),
            };
            self.inner
                .context
                .status_sink()
                .register(StatusRegistration::from_subscription(
                    self.id(),
                    invocation,
                    status_options,
                    subscription,
                ));
        }

        match self.hooks().run_before(&args) {
            Ok(true) => {}
            Ok(false) => {
                debug!(command = %self.id(), invocation, "vetoed by before-execute hook");
                return Step::Done(self.settle(invocation, args, Settlement::Aborted));
            }
            Err(err) => return Step::Done(self.settle(invocation, args, Settlement::Failed(err))),
        }

        {
            let mut state = self.lock();
            match state.running.as_mut() {
                Some(running) if running.invocation == invocation => running.phase = Phase::Busy,
                _ => return Step::Done(Ok(Outcome::Aborted)),
            }
            self.inner
                .channel
                .publish(invocation, CommandEvent::Busy(true));
        }

        let output = match (self.inner.handler)(args.clone(), handler_cancel.signal()) {
            HandlerOutput::Ready(res) => {
                let res = res.map(|value| Outcome::Completed(Some(value)));
                return Step::Done(self.settle_outcome(invocation, args, res));
            }
            deferred => deferred,
        };

        let (tx, rx) = oneshot::channel();
        let span = tracing::debug_span!("invocation", command = %self.id(), invocation);
        let this = self.clone();
        let observe = observe_cancel.signal();
        let external = options.signal;
        self.inner.context.spawn(
            async move {
                let outcome = match output {
                    HandlerOutput::Ready(res) => {
                        let res = res.map(|value| Outcome::Completed(Some(value)));
                        this.settle_outcome(invocation, args, res)
                    }
                    HandlerOutput::Future(fut) => {
                        this.drive_future(invocation, args, fut, observe, external)
                            .await
                    }
                    HandlerOutput::Stream(stream) => {
                        this.drive_stream(invocation, args, stream, observe, external)
                            .await
                    }
                };
                let _ = tx.send(outcome);
            }
            .instrument(span),
        );
        Step::Running(rx)
    }

    async fn drive_future(
        &self,
        invocation: u64,
        args: A,
        mut fut: BoxFuture<'static, CommandResult<Outcome<T>>>,
        observe: CancelSignal,
        external: Option<CancelSignal>,
    ) -> CommandResult<Outcome<T>> {
        let res = tokio::select! {
            biased;
            _ = observe.cancelled() => None,
            _ = external_cancelled(external) => {
                self.cancel();
                None
            }
            res = &mut fut => Some(res),
        };

        match res {
            Some(res) => self.settle_outcome(invocation, args, res),
            None => {
                if !self.inner.options.is_cancellable {
                    // left running, its outcome is no longer observed
                    self.inner.context.spawn(async move {
                        let _ = fut.await;
                    });
                }
                Ok(Outcome::Aborted)
            }
        }
    }

    async fn drive_stream(
        &self,
        invocation: u64,
        args: A,
        mut stream: BoxStream<'static, CommandResult<T>>,
        observe: CancelSignal,
        external: Option<CancelSignal>,
    ) -> CommandResult<Outcome<T>> {
        let external = external_cancelled(external);
        tokio::pin!(external);
        let mut last = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = observe.cancelled() => Next::Cancelled,
                _ = &mut external => {
                    self.cancel();
                    Next::Cancelled
                }
                item = stream.next() => Next::Item(item),
            };

            match next {
                Next::Cancelled => {
                    debug!(command = %self.id(), invocation, "stream subscription dropped");
                    return Ok(Outcome::Aborted);
                }
                Next::Item(Some(Ok(value))) => {
                    if self.emit(invocation, value.clone()) {
                        last = Some(value);
                    }
                }
                Next::Item(Some(Err(err))) => {
                    return self.settle(invocation, args, Settlement::Failed(err));
                }
                Next::Item(None) => {
                    return self.settle(invocation, args, Settlement::Succeeded(last));
                }
            }
        }
    }

    /// Record a value of a live invocation. Values of torn-down invocations
    /// are dropped.
    fn emit(&self, invocation: u64, value: T) -> bool {
        let mut state = self.lock();
        let live = state
            .running
            .as_ref()
            .is_some_and(|running| running.invocation == invocation && running.phase == Phase::Busy);
        if live {
            state.result = Some(value.clone());
            self.inner
                .channel
                .publish(invocation, CommandEvent::Result(value));
        }
        live
    }

    fn settle_outcome(
        &self,
        invocation: u64,
        args: A,
        res: CommandResult<Outcome<T>>,
    ) -> CommandResult<Outcome<T>> {
        match res {
            Ok(Outcome::Completed(Some(value))) => {
                self.emit(invocation, value.clone());
                self.settle(invocation, args, Settlement::Succeeded(Some(value)))
            }
            Ok(Outcome::Completed(None)) => self.settle(invocation, args, Settlement::Succeeded(None)),
            Ok(Outcome::Aborted) => self.settle(invocation, args, Settlement::Aborted),
            Err(err) => self.settle(invocation, args, Settlement::Failed(err)),
        }
    }

    /// End an invocation: error, busy off, after hooks, completed.
    fn settle(&self, invocation: u64, args: A, settlement: Settlement<T>) -> CommandResult<Outcome<T>> {
        {
            let mut state = self.lock();
            let Some(running) = state
                .running
                .as_mut()
                .filter(|running| running.invocation == invocation && running.phase != Phase::Finishing)
            else {
                // torn down by cancel()
                return Ok(Outcome::Aborted);
            };
            let was_busy = running.phase == Phase::Busy;
            running.phase = Phase::Finishing;

            if let Settlement::Failed(err) = &settlement {
                state.error = Some(err.clone());
                self.inner
                    .channel
                    .publish(invocation, CommandEvent::Error(err.clone()));
            }
            if was_busy {
                self.inner
                    .channel
                    .publish(invocation, CommandEvent::Busy(false));
            }
        }

        let (result, error, kind, outcome) = match settlement {
            Settlement::Succeeded(value) => (
                value.clone(),
                None,
                CompletionKind::Succeeded,
                Ok(Outcome::Completed(value)),
            ),
            Settlement::Failed(err) => {
                debug!(command = %self.id(), invocation, error = %err, "invocation failed");
                (None, Some(err.clone()), CompletionKind::Failed, Err(err))
            }
            Settlement::Aborted => (None, None, CompletionKind::Aborted, Ok(Outcome::Aborted)),
        };

        self.run_after_hooks(invocation, args, result, error);
        self.finish(invocation, kind);
        outcome
    }

    fn run_after_hooks(&self, invocation: u64, args: A, result: Option<T>, error: Option<CommandError>) {
        let report = AfterExecute { args, result, error };
        for err in self.hooks().run_after(&report) {
            warn!(command = %self.id(), invocation, error = %err, "after-execute hook failed");
            self.inner
                .channel
                .publish(invocation, CommandEvent::Error(err));
        }
    }

    fn finish(&self, invocation: u64, kind: CompletionKind) {
        {
            let mut state = self.lock();
            if state
                .running
                .as_ref()
                .is_some_and(|running| running.invocation == invocation)
            {
                state.running = None;
            }
            self.inner
                .channel
                .publish(invocation, CommandEvent::Completed(kind));
        }
        self.inner.finished.send_replace(invocation);
    }

    async fn drive(&self, step: Step<A, T>) -> CommandResult<Outcome<T>> {
        let mut step = step;
        loop {
            step = match step {
                Step::Done(outcome) => return outcome,
                Step::Running(rx) => return rx.await.unwrap_or(Ok(Outcome::Aborted)),
                Step::Queued(queued) => self.wait_queued(queued).await,
            };
        }
    }

    /// Wait for the running invocation to finish, then start unless a later
    /// trigger took this one's place.
    async fn wait_queued(&self, queued: Queued<A>) -> Step<A, T> {
        let Queued {
            ticket,
            mut awaiting,
            args,
            options,
        } = queued;
        let mut finished = self.inner.finished.subscribe();

        loop {
            let reached = async { finished.wait_for(|done| *done >= awaiting).await.is_ok() };
            let reached = tokio::select! {
                reached = reached => reached,
                _ = external_cancelled(options.signal.clone()) => false,
            };
            if !reached {
                return Step::Done(Ok(Outcome::Aborted));
            }

            let claim = {
                let mut state = self.lock();
                if state.pending_ticket != ticket {
                    return Step::Done(self.not_triggered(&state, &options));
                }
                match &state.running {
                    None => Some(self.claim(&mut state, args.clone(), &options)),
                    Some(running) => {
                        awaiting = running.invocation;
                        None
                    }
                }
            };

            if let Some(claim) = claim {
                return self.start(claim, options);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::stream;

    use reflex_core::CommandConfig;

    use super::*;
    use crate::handler::handler;
    use crate::options::ConcurrentTriggerBehavior;
    use crate::status::{InMemoryStatusSink, StatusEvent};

    fn ctx() -> CommandContext {
        CommandContext::current().unwrap()
    }

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn event_types<A, T>(sub: &mut Subscription<CommandEnvelope<A, T>>) -> Vec<&'static str>
    where
        A: Clone,
        T: Clone,
    {
        sub.drain()
            .iter()
            .map(|envelope| envelope.payload().event_type())
            .collect()
    }

    /// Handler whose invocations never finish on their own.
    fn pending_handler(calls: Arc<AtomicUsize>) -> Handler<u32, u32> {
        handler(move |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            HandlerOutput::stream(stream::pending())
        })
    }

    async fn settle_tasks() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    struct Teardown(Arc<AtomicUsize>);

    impl Drop for Teardown {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn sync_handler_sets_result_before_trigger_returns() {
        let cmd = Command::new(&ctx(), handler(|_: (), _| HandlerOutput::value(42)), CommandOptions::default());
        let mut busy = cmd.subscribe_busy();

        cmd.trigger(());

        assert_eq!(cmd.result(), Some(42));
        assert_eq!(busy.drain(), vec![false, true, false]);
        assert!(!cmd.is_busy());
    }

    #[tokio::test]
    async fn ignore_policy_runs_handler_once_while_busy() {
        let calls = counter();
        let cmd = Command::new(&ctx(), pending_handler(calls.clone()), CommandOptions::default());

        cmd.trigger(1);
        cmd.trigger(2);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cmd.is_busy());
        let second = cmd.trigger_async(3, TriggerOptions::default()).await.unwrap();
        assert!(second.is_aborted());
    }

    #[tokio::test]
    async fn throw_error_reports_already_running() {
        let cmd = Command::new(&ctx(), pending_handler(counter()), CommandOptions::default());
        cmd.trigger(1);

        let err = cmd
            .trigger_async(
                2,
                TriggerOptions::default().with_when_not_triggered(WhenNotTriggered::ThrowError),
            )
            .await
            .unwrap_err();
        assert!(err.is_already_running());
        assert!(err.to_string().contains("already running"));
    }

    #[tokio::test]
    async fn return_last_result_echoes_previous_value() {
        let (tx, rx) = futures::channel::mpsc::unbounded::<CommandResult<u32>>();
        let rx = Arc::new(Mutex::new(Some(rx)));
        let cmd = Command::new(
            &ctx(),
            handler(move |args: u32, _| match rx.lock().unwrap().take() {
                Some(rx) => HandlerOutput::stream(rx),
                None => HandlerOutput::value(args),
            }),
            CommandOptions::default().with_when_not_triggered(WhenNotTriggered::ReturnLastResult),
        );

        cmd.trigger(1);
        tx.unbounded_send(Ok(7)).unwrap();
        settle_tasks().await;
        assert!(cmd.is_busy());

        let echoed = cmd.trigger_async(2, TriggerOptions::default()).await.unwrap();
        assert_eq!(echoed, Outcome::Completed(Some(7)));
    }

    #[tokio::test]
    async fn cancel_running_tears_down_previous_stream() {
        let calls = counter();
        let teardowns = counter();
        let cmd = Command::new(
            &ctx(),
            {
                let calls = calls.clone();
                let teardowns = teardowns.clone();
                handler(move |_: u32, _| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let guard = Teardown(teardowns.clone());
                    HandlerOutput::stream(stream::pending::<CommandResult<u32>>().map(move |item| {
                        let _guard = &guard;
                        item
                    }))
                })
            },
            CommandOptions::default().with_policy(ConcurrencyPolicy::CancelRunning),
        );
        let mut events = cmd.subscribe();

        cmd.trigger(1);
        cmd.trigger(2);
        settle_tasks().await;

        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cmd.is_busy());
        assert_eq!(
            event_types(&mut events),
            vec![
                "command.triggered",
                "command.busy",
                "command.busy",
                "command.completed",
                "command.triggered",
                "command.busy",
            ]
        );
    }

    #[tokio::test]
    async fn wait_for_running_only_runs_last_queued_trigger() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cmd = Command::new(
            &ctx(),
            {
                let seen = seen.clone();
                handler(move |args: u32, _| {
                    seen.lock().unwrap().push(args);
                    HandlerOutput::future(async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(args * 10)
                    })
                })
            },
            CommandOptions::default().with_policy(ConcurrencyPolicy::WaitForRunning),
        );

        let t1 = cmd.trigger_async(1, TriggerOptions::default());
        let t2 = cmd.trigger_async(2, TriggerOptions::default());
        let t3 = cmd.trigger_async(3, TriggerOptions::default());
        let (r1, r2, r3) = tokio::join!(t1, t2, t3);

        assert_eq!(r1.unwrap(), Outcome::Completed(Some(10)));
        assert!(r2.unwrap().is_aborted());
        assert_eq!(r3.unwrap(), Outcome::Completed(Some(30)));
        assert_eq!(*seen.lock().unwrap(), vec![1, 3]);
    }

    #[tokio::test]
    async fn dropped_queued_future_keeps_its_trigger() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (release, gate) = watch::channel(false);
        let cmd = Command::new(
            &ctx(),
            {
                let seen = seen.clone();
                handler(move |args: u32, _| {
                    seen.lock().unwrap().push(args);
                    let mut gate = gate.clone();
                    HandlerOutput::future(async move {
                        let opened = gate.wait_for(|open| *open).await.is_ok();
                        assert!(opened);
                        Ok(args)
                    })
                })
            },
            CommandOptions::default().with_policy(ConcurrencyPolicy::WaitForRunning),
        );

        cmd.trigger(1);
        cmd.trigger(2);
        drop(cmd.trigger_async(3, TriggerOptions::default()));
        release.send_replace(true);

        for _ in 0..50 {
            if cmd.result() == Some(3) {
                break;
            }
            settle_tasks().await;
        }
        assert_eq!(*seen.lock().unwrap(), vec![1, 3]);
        assert_eq!(cmd.result(), Some(3));
    }

    #[tokio::test]
    async fn every_failure_reaches_the_error_stream() {
        let ctx = ctx().with_config(CommandConfig::default().with_channel_capacity(8));
        let cmd = Command::new(
            &ctx,
            handler(|_: u32, _| HandlerOutput::<u32>::error(CommandError::msg("nope"))),
            CommandOptions::default(),
        );
        let errors = cmd.errors();

        for n in 0..300 {
            cmd.trigger(n);
        }
        drop(cmd);

        assert_eq!(errors.count().await, 300);
    }

    #[tokio::test]
    async fn zero_channel_capacity_still_builds_a_working_command() {
        let config = CommandConfig {
            channel_capacity: 0,
            ..CommandConfig::default()
        };
        let cmd = Command::new(
            &ctx().with_config(config),
            handler(|n: u32, _| HandlerOutput::value(n + 1)),
            CommandOptions::default(),
        );
        let mut events = cmd.subscribe();

        cmd.trigger(1);

        assert_eq!(cmd.result(), Some(2));
        assert_eq!(event_types(&mut events).len(), 5);
    }

    #[tokio::test]
    async fn unchanged_params_echo_current_result() {
        let calls = counter();
        let cmd = Command::new(
            &ctx(),
            pending_handler(calls.clone()),
            CommandOptions::default().with_concurrent_trigger_behavior(
                ConcurrentTriggerBehavior::new(ConcurrencyPolicy::CancelRunning).only_when_params_changed(),
            ),
        );

        cmd.trigger(5);
        let echoed = cmd.trigger_async(5, TriggerOptions::default()).await.unwrap();

        assert_eq!(echoed, Outcome::Completed(None));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cmd.trigger(6);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn vetoed_trigger_aborts_without_busy_but_runs_after_hooks() {
        let calls = counter();
        let after = counter();
        let cmd = Command::new(&ctx(), pending_handler(calls.clone()), CommandOptions::default());
        cmd.add_before_execute_hook(|_| Ok(false));
        {
            let after = after.clone();
            cmd.add_after_execute_hook(move |report| {
                assert!(report.result.is_none() && report.error.is_none());
                after.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        let mut busy = cmd.subscribe_busy();
        let mut events = cmd.subscribe();

        let outcome = cmd.trigger_async(1, TriggerOptions::default()).await.unwrap();

        assert!(outcome.is_aborted());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(after.load(Ordering::SeqCst), 1);
        assert_eq!(busy.drain(), vec![false]);
        assert_eq!(event_types(&mut events), vec!["command.triggered", "command.completed"]);
    }

    #[tokio::test]
    async fn failing_before_hook_rejects_and_still_runs_after_hooks() {
        let after = counter();
        let cmd = Command::new(&ctx(), handler(|_: u32, _| HandlerOutput::value(1)), CommandOptions::default());
        cmd.add_before_execute_hook(|_| Err(CommandError::msg("gate broke")));
        {
            let after = after.clone();
            cmd.add_after_execute_hook(move |report| {
                assert!(report.error.is_some());
                after.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        let errors = cmd.errors();

        let err = cmd.trigger_async(1, TriggerOptions::default()).await.unwrap_err();

        assert_eq!(err.to_string(), "gate broke");
        assert_eq!(after.load(Ordering::SeqCst), 1);
        assert_eq!(cmd.error().map(|e| e.to_string()), Some("gate broke".to_string()));
        drop(cmd);
        let errors: Vec<_> = errors.collect().await;
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn after_hook_failure_goes_to_error_stream_only() {
        let cmd = Command::new(&ctx(), handler(|_: u32, _| HandlerOutput::value(42)), CommandOptions::default());
        cmd.add_after_execute_hook(|_| Err(CommandError::msg("telemetry down")));
        let mut events = cmd.subscribe();

        let outcome = cmd.trigger_async(1, TriggerOptions::default()).await.unwrap();

        assert_eq!(outcome, Outcome::Completed(Some(42)));
        assert!(cmd.error().is_none());
        assert_eq!(
            event_types(&mut events),
            vec![
                "command.triggered",
                "command.busy",
                "command.result",
                "command.busy",
                "command.error",
                "command.completed",
            ]
        );
    }

    #[tokio::test]
    async fn hooks_run_in_registration_order_around_handler() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let cmd = Command::new(
            &ctx(),
            {
                let order = order.clone();
                handler(move |_: u32, _| {
                    order.lock().unwrap().push("handler");
                    HandlerOutput::value(0)
                })
            },
            CommandOptions::default(),
        );
        for name in ["B1", "B2"] {
            let order = order.clone();
            cmd.add_before_execute_hook(move |_| {
                order.lock().unwrap().push(name);
                Ok(true)
            });
        }
        for name in ["A1", "A2"] {
            let order = order.clone();
            cmd.add_after_execute_hook(move |_| {
                order.lock().unwrap().push(name);
                Ok(())
            });
        }

        cmd.trigger(0);

        assert_eq!(*order.lock().unwrap(), vec!["B2", "B1", "handler", "A1", "A2"]);
    }

    #[tokio::test]
    async fn sync_failure_completes_once_with_one_error() {
        let cmd = Command::new(
            &ctx(),
            handler(|_: u32, _| HandlerOutput::<u32>::error(CommandError::msg("boom"))),
            CommandOptions::default(),
        );
        let mut busy = cmd.subscribe_busy();
        let mut events = cmd.subscribe();

        let err = cmd.trigger_async(1, TriggerOptions::default()).await.unwrap_err();

        assert_eq!(err.to_string(), "boom");
        assert_eq!(busy.drain(), vec![false, true, false]);
        let kinds = event_types(&mut events);
        assert_eq!(kinds.iter().filter(|k| **k == "command.error").count(), 1);
        assert_eq!(kinds.iter().filter(|k| **k == "command.completed").count(), 1);
        assert!(cmd.result().is_none());
        assert!(cmd.error().is_some());
    }

    #[tokio::test]
    async fn new_trigger_clears_previous_error() {
        let fail = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let cmd = Command::new(
            &ctx(),
            {
                let fail = fail.clone();
                handler(move |_: u32, _| {
                    if fail.load(Ordering::SeqCst) {
                        HandlerOutput::error(CommandError::msg("first"))
                    } else {
                        HandlerOutput::value(2)
                    }
                })
            },
            CommandOptions::default(),
        );

        cmd.trigger(1);
        assert!(cmd.error().is_some());

        fail.store(false, Ordering::SeqCst);
        cmd.trigger(1);
        assert!(cmd.error().is_none());
        assert_eq!(cmd.result(), Some(2));
    }

    #[tokio::test]
    async fn cancel_is_noop_when_idle() {
        let cmd = Command::new(&ctx(), handler(|_: u32, _| HandlerOutput::value(1)), CommandOptions::default());
        assert!(!cmd.cancel());
    }

    #[tokio::test]
    async fn cancel_resolves_pending_trigger_as_aborted() {
        let after = counter();
        let cmd = Command::new(
            &ctx(),
            handler(|_: u32, _| HandlerOutput::<u32>::future(std::future::pending())),
            CommandOptions::default(),
        );
        {
            let after = after.clone();
            cmd.add_after_execute_hook(move |_| {
                after.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        let completions = cmd.completions();

        let pending = cmd.trigger_async(1, TriggerOptions::default());
        assert!(cmd.is_busy());
        assert!(cmd.cancel());
        assert!(!cmd.is_busy());
        assert!(!cmd.cancel());

        assert!(pending.await.unwrap().is_aborted());
        assert_eq!(after.load(Ordering::SeqCst), 1);
        drop(cmd);
        assert_eq!(
            completions.collect::<Vec<_>>().await,
            vec![CompletionKind::Cancelled]
        );
    }

    async fn handler_signal_after_cancel(cancellable: bool) -> bool {
        let slot: Arc<Mutex<Option<CancelSignal>>> = Arc::default();
        let cmd = Command::new(
            &ctx(),
            {
                let slot = slot.clone();
                handler(move |_: u32, signal| {
                    *slot.lock().unwrap() = Some(signal);
                    HandlerOutput::<u32>::future(std::future::pending())
                })
            },
            CommandOptions::default().cancellable(cancellable),
        );

        cmd.trigger(1);
        assert!(cmd.cancel());
        settle_tasks().await;

        let signal = slot.lock().unwrap().take().unwrap();
        signal.is_cancelled()
    }

    #[tokio::test]
    async fn only_cancellable_commands_signal_the_handler() {
        assert!(handler_signal_after_cancel(true).await);
        assert!(!handler_signal_after_cancel(false).await);
    }

    #[tokio::test]
    async fn pre_cancelled_signal_is_a_noop() {
        let calls = counter();
        let cmd = Command::new(&ctx(), pending_handler(calls.clone()), CommandOptions::default());
        let mut events = cmd.subscribe();
        let controller = CancelController::new();
        controller.cancel();

        let outcome = cmd
            .trigger_async(1, TriggerOptions::default().with_signal(controller.signal()))
            .await
            .unwrap();

        assert!(outcome.is_aborted());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(events.drain().is_empty());
    }

    #[tokio::test]
    async fn external_signal_cancels_invocation_in_flight() {
        let cmd = Command::new(&ctx(), pending_handler(counter()), CommandOptions::default());
        let controller = CancelController::new();
        let completions = cmd.completions();

        let pending = cmd.trigger_async(1, TriggerOptions::default().with_signal(controller.signal()));
        settle_tasks().await;
        controller.cancel();

        assert!(pending.await.unwrap().is_aborted());
        assert!(!cmd.is_busy());
        drop(cmd);
        assert_eq!(
            completions.collect::<Vec<_>>().await,
            vec![CompletionKind::Cancelled]
        );
    }

    #[tokio::test]
    async fn stream_emissions_update_result_until_completion() {
        let cmd = Command::new(
            &ctx(),
            handler(|_: u32, _| HandlerOutput::stream(stream::iter([Ok(1), Ok(2), Ok(3)]))),
            CommandOptions::default(),
        );
        let results = cmd.results();

        let outcome = cmd.trigger_async(0, TriggerOptions::default()).await.unwrap();

        assert_eq!(outcome, Outcome::Completed(Some(3)));
        assert_eq!(cmd.result(), Some(3));
        drop(cmd);
        assert_eq!(results.collect::<Vec<_>>().await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn stream_error_fails_invocation_but_keeps_earlier_result() {
        let cmd = Command::new(
            &ctx(),
            handler(|_: u32, _| {
                HandlerOutput::stream(stream::iter([Ok(1), Err(CommandError::msg("lost connection"))]))
            }),
            CommandOptions::default(),
        );

        let err = cmd.trigger_async(0, TriggerOptions::default()).await.unwrap_err();

        assert_eq!(err.to_string(), "lost connection");
        assert_eq!(cmd.result(), Some(1));
        assert!(!cmd.is_busy());
    }

    #[tokio::test]
    async fn invocations_are_reported_to_status_sink() {
        let sink = Arc::new(InMemoryStatusSink::new());
        let ctx = ctx().with_status_sink(sink.clone());
        let cmd = Command::new(
            &ctx,
            handler(|_: u32, _| HandlerOutput::value(1)),
            CommandOptions::default().with_status(crate::options::StatusOptions::default().with_label("Load")),
        );

        cmd.trigger(1);
        cmd.trigger_with(2, TriggerOptions::default().suppress_status());

        let mut registrations = sink.take();
        assert_eq!(registrations.len(), 1);
        let registration = registrations.remove(0);
        assert_eq!(registration.invocation, 1);
        assert_eq!(registration.options.label.as_deref(), Some("Load"));

        let events: Vec<_> = registration.events.collect().await;
        assert!(matches!(
            events.as_slice(),
            [
                StatusEvent::Busy(true),
                StatusEvent::Result,
                StatusEvent::Busy(false),
                StatusEvent::Completed(CompletionKind::Succeeded)
            ]
        ));
    }

    #[tokio::test]
    async fn disabled_status_skips_registration() {
        let sink = Arc::new(InMemoryStatusSink::new());
        let ctx = ctx()
            .with_status_sink(sink.clone())
            .with_config(reflex_core::CommandConfig::default().with_status_enabled(false));
        let cmd = Command::new(&ctx, handler(|_: u32, _| HandlerOutput::value(1)), CommandOptions::default());

        cmd.trigger(1);

        assert!(sink.is_empty());
    }
}
