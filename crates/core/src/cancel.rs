//! Cooperative cancellation.
//!
//! A [`CancelController`] owns the right to cancel; any number of
//! [`CancelSignal`]s observe it. Signals can be polled synchronously with
//! [`CancelSignal::is_cancelled`] or awaited with [`CancelSignal::cancelled`].
//!
//! Cancellation is sticky: once fired it cannot be reset. Dropping every
//! controller without cancelling leaves the signals un-cancelled forever.

use std::sync::Arc;

use tokio::sync::watch;

/// Owner side of a cancellation token.
///
/// `Clone` is cheap and every clone controls the same token.
#[derive(Debug, Clone)]
pub struct CancelController {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the token. Returns `true` if this call performed the transition.
    pub fn cancel(&self) -> bool {
        self.tx.send_if_modified(|cancelled| {
            if *cancelled {
                false
            } else {
                *cancelled = true;
                true
            }
        })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// A new observer of this token.
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CancelController {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a cancellation token.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the token is cancelled.
    ///
    /// If every controller is dropped without cancelling, this future stays
    /// pending.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}
