use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Outbound side of one connected peer
#[derive(Clone, Debug)]
pub struct Subscriber {
    pub id: Uuid,
    queue: mpsc::UnboundedSender<String>,
}

impl Subscriber {
    /// Enqueue without blocking; false if the receiving session is gone
    pub fn enqueue(&self, message: String) -> bool {
        self.queue.send(message).is_ok()
    }
}

/// Set of live subscribers, read on every store mutation
pub struct SubscriberRegistry {
    subscribers: DashMap<Uuid, Subscriber>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
        }
    }

    /// Create a subscriber and add it to the registry.
    ///
    /// The subscriber stays registered until the returned handle is dropped
    /// (or `remove` is called with its id).
    pub fn register(
        self: &Arc<Self>,
    ) -> (SubscriberHandle, mpsc::UnboundedReceiver<String>) {
        let (queue, rx) = mpsc::unbounded_channel();
        let subscriber = Subscriber {
            id: Uuid::new_v4(),
            queue,
        };
        let id = subscriber.id;
        self.subscribers.insert(id, subscriber);

        info!(subscriber_id = %id, subscribers = self.subscribers.len(), "Subscriber registered");

        let handle = SubscriberHandle {
            id,
            registry: Arc::clone(self),
        };
        (handle, rx)
    }

    /// Remove a subscriber. Removing an unknown id is a no-op.
    pub fn remove(&self, id: &Uuid) -> bool {
        let removed = self.subscribers.remove(id).is_some();
        if removed {
            info!(subscriber_id = %id, subscribers = self.subscribers.len(), "Subscriber removed");
        }
        removed
    }

    /// Enqueue `message` on every registered subscriber.
    ///
    /// Returns the number of subscribers it was enqueued on.
    pub fn broadcast(&self, message: &str) -> usize {
        let mut delivered = 0;
        for subscriber in self.subscribers.iter() {
            if subscriber.enqueue(message.to_string()) {
                delivered += 1;
            } else {
                // Session writer already gone; its handle removes the entry shortly
                debug!(subscriber_id = %subscriber.id, "Skipping closed subscriber queue");
            }
        }
        delivered
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.subscribers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry membership of one subscriber; dropping it unregisters.
pub struct SubscriberHandle {
    id: Uuid,
    registry: Arc<SubscriberRegistry>,
}

impl SubscriberHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}
