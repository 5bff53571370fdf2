//! Typed event channels with multi-subscriber fan-out
//!
//! Signals are the public contract for provider availability, session
//! closure, and script messages. Each subscriber gets its own unbounded
//! queue; delivery is in emission order per signal, and a slow subscriber
//! never blocks the emitter or its peers.

use std::sync::Mutex;

use tokio::sync::mpsc;

/// A typed event channel
#[derive(Debug)]
pub struct Signal<T> {
    /// Live subscriber queues; dead ones are pruned on emit
    subscribers: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> Signal<T> {
    /// Create a signal with no subscribers
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        Subscription { rx }
    }

    /// Deliver `value` to every live subscriber
    pub fn emit(&self, value: T) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(value.clone()).is_ok());
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

impl<T: Clone> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a [`Signal`]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// Wait for the next event; `None` once the signal is dropped
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take an event without waiting, if one is queued
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out() {
        let signal = Signal::new();
        let mut first = signal.subscribe();
        let mut second = signal.subscribe();

        signal.emit(1u32);
        signal.emit(2u32);

        assert_eq!(first.recv().await, Some(1));
        assert_eq!(first.recv().await, Some(2));
        assert_eq!(second.recv().await, Some(1));
        assert_eq!(second.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let signal = Signal::new();
        let first = signal.subscribe();
        let _second = signal.subscribe();
        assert_eq!(signal.subscriber_count(), 2);

        drop(first);
        signal.emit(0u32);
        assert_eq!(signal.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_no_subscribers() {
        let signal = Signal::new();
        // Emitting into the void must not panic
        signal.emit("event".to_string());
    }

    #[tokio::test]
    async fn test_try_recv() {
        let signal = Signal::new();
        let mut sub = signal.subscribe();

        assert!(sub.try_recv().is_none());
        signal.emit(7u32);
        assert_eq!(sub.try_recv(), Some(7));
    }
}
