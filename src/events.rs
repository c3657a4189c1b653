//! The observer's event stream.
//!
//! The source this library is modeled on notifies observers through heap
//! objects with signal subscriptions shared by reference count. That
//! pattern doesn't translate: here each subscriber owns an independent
//! channel fed from a single tagged-variant stream, and a subscription is a
//! plain integer token whose removal is an O(1) map operation, not a
//! reference-count teardown.

use std::collections::HashMap;

use tokio::sync::mpsc;

/// One notification emitted by the bus observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    NodeAdded(u32),
    NodeRemoved(u32),
    ServiceAdded(u32, u32),
    ServiceRemoved(u32, u32),
}

/// Handle returned by [`EventHub::subscribe`]. Pass to
/// [`EventHub::unsubscribe`] to detach; dropping the paired receiver instead
/// has the same effect the next time an event is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

/// Fan-out registry of event subscribers, owned by the observer.
#[derive(Debug, Default)]
pub(crate) struct EventHub {
    next_token: u64,
    subscribers: HashMap<u64, mpsc::UnboundedSender<Event>>,
}

impl EventHub {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber and returns its token and receiving end.
    /// The receiver observes every event kind; callers filter by matching
    /// on [`Event`].
    ///
    /// # Test
    ///
    /// ```ignore
    /// let mut hub = EventHub::new();
    /// let (token, mut rx) = hub.subscribe();
    /// hub.emit(Event::NodeAdded(5));
    /// assert_eq!(rx.try_recv().unwrap(), Event::NodeAdded(5));
    /// hub.unsubscribe(token);
    /// ```
    pub(crate) fn subscribe(&mut self) -> (SubscriptionToken, mpsc::UnboundedReceiver<Event>) {
        let token = self.next_token;
        self.next_token += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(token, tx);

        (SubscriptionToken(token), rx)
    }

    pub(crate) fn unsubscribe(&mut self, token: SubscriptionToken) {
        self.subscribers.remove(&token.0);
    }

    /// Delivers `event` to every live subscriber, in the order subscribers
    /// were registered is not guaranteed across a `HashMap`, but a single
    /// subscriber always observes its own events in emission order since
    /// each subscriber's channel is FIFO. Subscribers whose receiver was
    /// dropped are pruned.
    pub(crate) fn emit(&mut self, event: Event) {
        self.subscribers.retain(|_, tx| tx.send(event).is_ok());
    }
}
