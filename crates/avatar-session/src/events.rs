//! Typed event fan-out for client lifecycle and content events.
//!
//! Every client owns one `EventBus<T>`; the controller subscribes once when it
//! wires a session and drops the receiver on stop.

use tokio::sync::broadcast;
use tracing::trace;

/// Events beyond this capacity make slow subscribers lag.
const DEFAULT_CAPACITY: usize = 256;

/// A broadcast channel carrying one client's events.
#[derive(Debug)]
pub struct EventBus<T: Clone> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone + std::fmt::Debug> EventBus<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event; returns how many subscribers saw it.
    /// Events with no subscriber are dropped.
    pub fn emit(&self, event: T) -> usize {
        trace!(target: "avatar::events", ?event, "emit");
        self.sender.send(event).unwrap_or(0)
    }

    /// Receive all future events. Past events are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }
}

impl<T: Clone + std::fmt::Debug> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_every_subscriber() {
        let bus: EventBus<u32> = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.emit(7), 2);
        assert_eq!(a.recv().await.unwrap(), 7);
        assert_eq!(b.recv().await.unwrap(), 7);
    }

    #[test]
    fn emit_without_subscribers_is_dropped() {
        let bus: EventBus<&'static str> = EventBus::new();
        assert_eq!(bus.emit("lost"), 0);
        let mut rx = bus.subscribe();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropping_receiver_unsubscribes() {
        let bus: EventBus<u8> = EventBus::new();
        let rx = bus.subscribe();
        assert_eq!(bus.emit(1), 1);
        drop(rx);
        assert_eq!(bus.emit(2), 0);
    }
}
