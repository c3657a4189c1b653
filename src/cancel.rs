//! Cancellation shared between a caller and the operation it started.
//!
//! `wait_for_node`, `create`, and `ClientChannel::send` each race a pending
//! operation against an external cancel signal and a timeout, with the
//! first of the three to fire winning and the other two simply dropped.
//! That shape is the same "shared completion, first caller wins" problem,
//! generalized from a single-shot oneshot pair to a signal a caller can
//! hold onto and fire from outside the operation it cancels, possibly
//! racing more than one operation against the same handle.

use tokio::sync::watch;

/// Caller-held half of a cancellation pair. Firing it is idempotent and
/// wakes every outstanding [`Cancel::cancelled`] waiter.
#[derive(Debug, Clone)]
pub struct CancelHandle(watch::Sender<bool>);

/// Callee-held half of a cancellation pair, passed into the operation it
/// cancels.
#[derive(Debug, Clone)]
pub struct Cancel(watch::Receiver<bool>);

/// Creates a fresh, unfired cancellation pair.
pub fn cancel_pair() -> (CancelHandle, Cancel) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), Cancel(rx))
}

impl CancelHandle {
    /// Fires the cancellation. A no-op if every [`Cancel`] has already been
    /// dropped.
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

impl Cancel {
    /// A [`Cancel`] that never fires, for callers with no cancellation
    /// source of their own.
    pub fn never() -> Self {
        cancel_pair().1
    }

    /// Resolves once [`CancelHandle::cancel`] has been called.
    pub async fn cancelled(&mut self) {
        let _ = self.0.wait_for(|fired| *fired).await;
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}
