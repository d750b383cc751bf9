//! Observer sets.
//!
//! An observer is one client connection's outbound event queue. Broadcasting clones the
//! current set under the read lock and sends outside of it, so observers may be added or
//! removed while a broadcast is in progress. Observers whose queue has closed are
//! pruned after the send.

use nim_core::DeviceEvent;
use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

/// Identity of one client connection.
pub type ObserverId = Uuid;

/// Outbound event queue of one client connection.
#[derive(Debug, Clone)]
pub struct Observer {
    /// Stable identity used for subscribe/unsubscribe.
    pub id: ObserverId,
    tx: UnboundedSender<DeviceEvent>,
}

impl Observer {
    /// Wrap a connection's sender with a fresh identity.
    pub fn new(tx: UnboundedSender<DeviceEvent>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
        }
    }

    /// Queue `event`; false once the connection is gone.
    pub fn send(&self, event: DeviceEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Whether the connection has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Set of observers of one session, or of every session.
#[derive(Debug, Default)]
pub struct SubscriberSet {
    observers: RwLock<Vec<Observer>>,
}

impl SubscriberSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `observer` unless an observer with the same id is present.
    ///
    /// Returns true when the observer was added.
    pub fn add(&self, observer: Observer) -> bool {
        let mut observers = self.observers.write();
        if observers.iter().any(|o| o.id == observer.id) {
            return false;
        }
        observers.push(observer);
        true
    }

    /// Remove an observer; returns whether it was present.
    pub fn remove(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|o| o.id != id);
        observers.len() != before
    }

    /// Whether `id` is in the set.
    pub fn contains(&self, id: ObserverId) -> bool {
        self.observers.read().iter().any(|o| o.id == id)
    }

    /// Copy of the current set.
    pub fn snapshot(&self) -> Vec<Observer> {
        self.observers.read().clone()
    }

    /// Send `event` to every observer, pruning closed ones. Returns the number reached.
    pub fn broadcast(&self, event: &DeviceEvent) -> usize {
        let snapshot = self.snapshot();
        let mut delivered = 0;
        let mut closed = Vec::new();
        for observer in &snapshot {
            if observer.send(event.clone()) {
                delivered += 1;
            } else {
                closed.push(observer.id);
            }
        }
        if !closed.is_empty() {
            self.observers.write().retain(|o| !closed.contains(&o.id));
        }
        delivered
    }

    /// Empty the set, returning what it held.
    pub fn drain(&self) -> Vec<Observer> {
        std::mem::take(&mut *self.observers.write())
    }

    /// Number of observers.
    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    /// True when nobody is listening.
    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }
}
