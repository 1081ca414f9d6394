//! Per-command result channel.
//!
//! A [`ResultChannel`] is the only way a command talks to its observers. It
//! owns one ordered bus of [`CommandEnvelope`]s; the typed streams
//! (`results`, `errors`, `completions`, `triggers`, busy) are filtered views of
//! that single bus, so events of different kinds are never reordered relative
//! to each other.
//!
//! Busy has replay semantics: [`ResultChannel::subscribe_busy`] yields the
//! current value first and then every transition, without coalescing.

use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::watch;

use reflex_core::{CommandError, CommandId};

use crate::bus::{EventBus, Subscription};
use crate::envelope::EventEnvelope;
use crate::event::{CommandEvent, CompletionKind};
use crate::in_memory_bus::InMemoryEventBus;

/// Envelope type carried by a command's channel.
pub type CommandEnvelope<A, T> = EventEnvelope<CommandEvent<A, T>>;

#[derive(Debug, Default)]
struct ChannelState {
    busy: bool,
    sequence: u64,
}

/// Broadcast of one command's lifecycle events.
#[derive(Debug)]
pub struct ResultChannel<A, T> {
    command_id: CommandId,
    bus: InMemoryEventBus<CommandEnvelope<A, T>>,
    state: Mutex<ChannelState>,
    busy_tx: watch::Sender<bool>,
}

impl<A, T> ResultChannel<A, T>
where
    A: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// `backlog_warning`: undelivered events per subscriber before a slow
    /// consumer is logged.
    pub fn new(command_id: CommandId, backlog_warning: usize) -> Self {
        let (busy_tx, _busy_rx) = watch::channel(false);
        Self {
            command_id,
            bus: InMemoryEventBus::new(backlog_warning),
            state: Mutex::new(ChannelState::default()),
            busy_tx,
        }
    }

    pub fn command_id(&self) -> CommandId {
        self.command_id
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish an event for `invocation` and return its sequence number.
    ///
    /// `Busy` events also update the synchronously readable busy flag.
    pub fn publish(&self, invocation: u64, event: CommandEvent<A, T>) -> u64 {
        let mut state = self.lock();
        state.sequence += 1;
        if let CommandEvent::Busy(busy) = &event {
            state.busy = *busy;
            self.busy_tx.send_replace(*busy);
        }

        tracing::trace!(
            command = %self.command_id,
            invocation,
            sequence = state.sequence,
            event = event.event_type(),
            "publish"
        );

        let envelope = EventEnvelope::new(self.command_id, invocation, state.sequence, event);
        let _ = self.bus.publish(envelope);
        state.sequence
    }

    pub fn is_busy(&self) -> bool {
        self.lock().busy
    }

    /// Every envelope published from now on.
    pub fn subscribe(&self) -> Subscription<CommandEnvelope<A, T>> {
        self.bus.subscribe()
    }

    /// Current busy value followed by every later transition.
    pub fn subscribe_busy(&self) -> BusySubscription<A, T> {
        // Read and subscribe under the lock so no transition falls in between.
        let state = self.lock();
        BusySubscription {
            initial: Some(state.busy),
            inner: self.bus.subscribe(),
        }
    }

    /// Latest-value view of busy (coalesces fast transitions).
    pub fn busy_watch(&self) -> watch::Receiver<bool> {
        self.busy_tx.subscribe()
    }

    pub fn events(&self) -> BoxStream<'static, CommandEnvelope<A, T>> {
        self.subscribe().into_stream()
    }

    pub fn results(&self) -> BoxStream<'static, T> {
        self.events()
            .filter_map(|envelope| {
                future::ready(match envelope.into_payload() {
                    CommandEvent::Result(value) => Some(value),
                    _ => None,
                })
            })
            .boxed()
    }

    pub fn errors(&self) -> BoxStream<'static, CommandError> {
        self.events()
            .filter_map(|envelope| {
                future::ready(match envelope.into_payload() {
                    CommandEvent::Error(err) => Some(err),
                    _ => None,
                })
            })
            .boxed()
    }

    pub fn completions(&self) -> BoxStream<'static, CompletionKind> {
        self.events()
            .filter_map(|envelope| {
                future::ready(match envelope.into_payload() {
                    CommandEvent::Completed(kind) => Some(kind),
                    _ => None,
                })
            })
            .boxed()
    }

    pub fn triggers(&self) -> BoxStream<'static, A> {
        self.events()
            .filter_map(|envelope| {
                future::ready(match envelope.into_payload() {
                    CommandEvent::Triggered { args, .. } => Some(args),
                    _ => None,
                })
            })
            .boxed()
    }

    /// Stream form of [`subscribe_busy`](Self::subscribe_busy).
    pub fn busy_changes(&self) -> BoxStream<'static, bool> {
        self.subscribe_busy().into_stream()
    }
}

/// Busy observer with replay of the value current at subscription time.
#[derive(Debug)]
pub struct BusySubscription<A, T> {
    initial: Option<bool>,
    inner: Subscription<CommandEnvelope<A, T>>,
}

fn busy_of<A, T>(envelope: &CommandEnvelope<A, T>) -> Option<bool> {
    match envelope.payload() {
        CommandEvent::Busy(busy) => Some(*busy),
        _ => None,
    }
}

impl<A, T> BusySubscription<A, T>
where
    A: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub async fn recv(&mut self) -> Option<bool> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        loop {
            let envelope = self.inner.recv().await?;
            if let Some(busy) = busy_of(&envelope) {
                return Some(busy);
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<bool> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        loop {
            let envelope = self.inner.try_recv()?;
            if let Some(busy) = busy_of(&envelope) {
                return Some(busy);
            }
        }
    }

    /// Every busy value already available, in order.
    pub fn drain(&mut self) -> Vec<bool> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn into_stream(self) -> BoxStream<'static, bool> {
        let transitions = self
            .inner
            .into_stream()
            .filter_map(|envelope| future::ready(busy_of(&envelope)));
        stream::iter(self.initial).chain(transitions).boxed()
    }
}
