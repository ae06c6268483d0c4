//! Typed publish/subscribe used by every component to expose its events.
//!
//! A bus is an owned value: each component receives its bus by injection and
//! clones of the bus share one subscriber list. Subscribers are unbounded
//! `mpsc` receivers, so `emit` never blocks and never awaits.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Receiving half handed to a subscriber. Dropping it unsubscribes.
pub type Subscription<E> = mpsc::UnboundedReceiver<E>;

pub struct EventBus<E> {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<E>>>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber. Events emitted before this call are not
    /// replayed.
    pub fn subscribe(&self) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber, pruning dropped ones.
    pub fn emit(&self, event: E) {
        let mut subs = self.subscribers.lock();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Drop every subscriber; their receivers observe end-of-stream.
    pub fn clear(&self) {
        self.subscribers.lock().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.subscribers.lock();
        subs.retain(|tx| !tx.is_closed());
        subs.len()
    }
}
