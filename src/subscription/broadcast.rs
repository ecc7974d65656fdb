use crate::state::{Attributes, MutationListener};
use crate::subscription::protocol::encode_update;
use crate::subscription::SubscriberRegistry;
use std::sync::Arc;
use tracing::debug;

/// Store listener that fans every mutation out to all subscribers.
///
/// Runs inside the store's critical section, so every subscriber queue
/// receives updates in the global mutation order.
pub struct BroadcastListener {
    registry: Arc<SubscriberRegistry>,
}

impl BroadcastListener {
    pub fn new(registry: Arc<SubscriberRegistry>) -> Self {
        Self { registry }
    }
}

impl MutationListener for BroadcastListener {
    fn on_mutate(&self, entity_id: &str, attributes: &Attributes) {
        let message = encode_update(entity_id, attributes);
        let recipients = self.registry.broadcast(&message);

        debug!(entity_id = %entity_id, recipients = recipients, "Broadcast entity update");
    }
}
