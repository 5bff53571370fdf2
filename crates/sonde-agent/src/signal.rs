//! Agent-side event fan-out

use std::sync::Mutex;

use tokio::sync::mpsc;

/// A typed event channel with per-subscriber queues
pub struct Signal<T> {
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
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(value.clone()).is_ok());
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
