//! Multicast event delivery
//!
//! `EventBus` fans events out to any number of subscribers. A bus created
//! with [`EventBus::new`] gives every subscriber its own unbounded queue, so
//! nothing is lost between components that must see every event. A bus
//! created with [`EventBus::with_replay`] is a bounded broadcast channel for
//! outside observers: it keeps the most recent event and hands it to late
//! subscribers first, and a subscriber that falls behind skips the oldest
//! events.

use log::warn;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::mpsc;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

enum Delivery<T> {
    Queued(Mutex<Vec<mpsc::UnboundedSender<T>>>),
    Broadcast(broadcast::Sender<T>),
}

struct Inner<T> {
    delivery: Delivery<T>,
    last: Mutex<Option<T>>,
    replay: bool,
}

/// A cloneable handle to a multicast event channel
pub struct EventBus<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> EventBus<T> {
    /// Creates a lossless bus without replay
    pub fn new() -> Self {
        Self::build(Delivery::Queued(Mutex::new(Vec::new())), false)
    }

    /// Creates a bounded bus that replays the latest event to new subscribers
    pub fn with_replay(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self::build(Delivery::Broadcast(sender), true)
    }

    fn build(delivery: Delivery<T>, replay: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                delivery,
                last: Mutex::new(None),
                replay,
            }),
        }
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn emit(&self, event: T) {
        let mut last = lock(&self.inner.last);
        if self.inner.replay {
            *last = Some(event.clone());
        }
        // holding the guard keeps replay snapshot and live stream consistent
        match &self.inner.delivery {
            Delivery::Queued(senders) => {
                lock(senders).retain(|sender| sender.send(event.clone()).is_ok());
            }
            Delivery::Broadcast(sender) => {
                let _ = sender.send(event);
            }
        }
    }

    pub fn subscribe(&self) -> EventSubscription<T> {
        let last = lock(&self.inner.last);
        let receiver = match &self.inner.delivery {
            Delivery::Queued(senders) => {
                let (tx, rx) = mpsc::unbounded_channel();
                lock(senders).push(tx);
                Receiver::Queued(rx)
            }
            Delivery::Broadcast(sender) => Receiver::Broadcast(sender.subscribe()),
        };
        EventSubscription {
            replay: last.clone(),
            receiver,
        }
    }

    /// The most recent event, if this bus replays
    pub fn last(&self) -> Option<T> {
        lock(&self.inner.last).clone()
    }

    pub fn subscriber_count(&self) -> usize {
        match &self.inner.delivery {
            Delivery::Queued(senders) => lock(senders).iter().filter(|s| !s.is_closed()).count(),
            Delivery::Broadcast(sender) => sender.receiver_count(),
        }
    }
}

enum Receiver<T> {
    Queued(mpsc::UnboundedReceiver<T>),
    Broadcast(broadcast::Receiver<T>),
}

/// One subscriber's view of an [`EventBus`]
pub struct EventSubscription<T> {
    replay: Option<T>,
    receiver: Receiver<T>,
}

impl<T: Clone> EventSubscription<T> {
    /// Waits for the next event. Returns None once every bus handle is gone.
    pub async fn recv(&mut self) -> Option<T> {
        if let Some(event) = self.replay.take() {
            return Some(event);
        }
        match &mut self.receiver {
            Receiver::Queued(rx) => rx.recv().await,
            Receiver::Broadcast(rx) => loop {
                match rx.recv().await {
                    Ok(event) => return Some(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Event subscriber lagged behind, {} events skipped", skipped);
                    }
                    Err(RecvError::Closed) => return None,
                }
            },
        }
    }

    /// Returns the next event if one is already queued
    pub fn try_recv(&mut self) -> Option<T> {
        if let Some(event) = self.replay.take() {
            return Some(event);
        }
        match &mut self.receiver {
            Receiver::Queued(rx) => rx.try_recv().ok(),
            Receiver::Broadcast(rx) => loop {
                match rx.try_recv() {
                    Ok(event) => return Some(event),
                    Err(TryRecvError::Lagged(skipped)) => {
                        warn!("Event subscriber lagged behind, {} events skipped", skipped);
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn late_subscriber_sees_latest_event_first() {
        let bus = EventBus::with_replay(8);
        bus.emit(1);
        bus.emit(2);
        let mut sub = bus.subscribe();
        bus.emit(3);
        assert_eq!(sub.recv().await, Some(2));
        assert_eq!(sub.recv().await, Some(3));
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn plain_bus_does_not_replay() {
        let bus = EventBus::new();
        bus.emit("stale");
        let mut sub = bus.subscribe();
        assert_eq!(sub.try_recv(), None);
        assert_eq!(bus.last(), None);
        bus.emit("fresh");
        assert_eq!(sub.recv().await, Some("fresh"));
    }

    #[tokio::test]
    async fn every_subscriber_receives_each_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        bus.emit(7u8);
        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }

    #[tokio::test]
    async fn plain_bus_keeps_every_event_for_a_slow_subscriber() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        for i in 0..1000 {
            bus.emit(i);
        }
        for i in 0..1000 {
            assert_eq!(sub.try_recv(), Some(i));
        }
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        drop(sub);
        bus.emit(1u8);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn lagging_replay_subscriber_skips_to_retained_events() {
        let bus = EventBus::with_replay(2);
        let mut sub = bus.subscribe();
        for i in 0..5 {
            bus.emit(i);
        }
        assert_eq!(sub.recv().await, Some(3));
        assert_eq!(sub.recv().await, Some(4));
    }

    #[tokio::test]
    async fn recv_ends_when_bus_is_dropped() {
        let bus: EventBus<u8> = EventBus::new();
        let mut sub = bus.subscribe();
        drop(bus);
        assert_eq!(sub.recv().await, None);

        let bus: EventBus<u8> = EventBus::with_replay(2);
        let mut sub = bus.subscribe();
        drop(bus);
        assert_eq!(sub.recv().await, None);
    }
}
