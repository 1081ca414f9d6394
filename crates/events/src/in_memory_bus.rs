//! In-memory event bus.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::bus::{EventBus, Subscription};

#[derive(Debug)]
struct Subscriber<M> {
    tx: mpsc::UnboundedSender<M>,
    backlog: Arc<AtomicUsize>,
}

/// In-memory pub/sub bus.
///
/// - No IO
/// - Lossless fan-out to every live subscription
/// - Publishing without subscribers is not an error (the message is dropped)
///
/// A subscription holding more than `backlog_warning` undelivered messages is
/// reported once each time it crosses that mark; nothing is discarded.
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<Subscriber<M>>>,
    backlog_warning: usize,
}

impl<M> InMemoryEventBus<M> {
    /// A zero `backlog_warning` is treated as 1.
    pub fn new(backlog_warning: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            backlog_warning: backlog_warning.max(1),
        }
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = std::convert::Infallible;

    fn publish(&self, message: M) -> Result<usize, Self::Error> {
        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);

        // Drop any dead subscribers while publishing.
        subs.retain(|sub| {
            let pending = sub.backlog.fetch_add(1, Ordering::AcqRel) + 1;
            if sub.tx.send(message.clone()).is_err() {
                return false;
            }
            if pending == self.backlog_warning {
                tracing::warn!(pending, "subscriber is falling behind");
            }
            true
        });

        Ok(subs.len())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));

        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber {
                tx,
                backlog: backlog.clone(),
            });

        Subscription::new(rx, backlog)
    }
}
