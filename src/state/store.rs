use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Attribute mapping of a single entity (attribute name -> JSON value)
pub type Attributes = Map<String, Value>;

/// Snapshot of the whole store (entity id -> attributes object)
pub type World = Map<String, Value>;

/// Observer notified after every `set`/`update`.
///
/// Invoked while the store lock is held, so implementations must not call
/// back into the store.
pub trait MutationListener: Send + Sync {
    fn on_mutate(&self, entity_id: &str, attributes: &Attributes);
}

impl<F> MutationListener for F
where
    F: Fn(&str, &Attributes) + Send + Sync,
{
    fn on_mutate(&self, entity_id: &str, attributes: &Attributes) {
        self(entity_id, attributes)
    }
}

struct Inner {
    entities: HashMap<String, Attributes>,
    listeners: Vec<Arc<dyn MutationListener>>,
}

impl Inner {
    fn notify(&self, entity_id: &str) {
        let empty = Attributes::new();
        let attributes = self.entities.get(entity_id).unwrap_or(&empty);
        for listener in &self.listeners {
            listener.on_mutate(entity_id, attributes);
        }
    }
}

/// In-memory world state shared by every connection and HTTP handler.
///
/// A single mutex covers both the entities and the listener list: a mutation
/// and the notification of all listeners happen in one critical section, so
/// listeners observe mutations in the same global order they were applied.
pub struct EntityStore {
    inner: Mutex<Inner>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entities: HashMap::new(),
                listeners: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the entity's attributes wholesale
    pub fn set(&self, entity_id: &str, attributes: Attributes) -> Attributes {
        let mut inner = self.lock();
        inner
            .entities
            .insert(entity_id.to_string(), attributes.clone());
        inner.notify(entity_id);

        debug!(entity_id = %entity_id, "Entity set");
        attributes
    }

    /// Set a single attribute, keeping the others (entity is created if unseen)
    pub fn update(&self, entity_id: &str, key: &str, value: Value) -> Attributes {
        let mut inner = self.lock();
        let entry = inner.entities.entry(entity_id.to_string()).or_default();
        entry.insert(key.to_string(), value);
        let attributes = entry.clone();
        inner.notify(entity_id);

        debug!(entity_id = %entity_id, key = %key, "Entity attribute updated");
        attributes
    }

    /// Current attributes, or an empty mapping for an unknown entity
    pub fn get(&self, entity_id: &str) -> Attributes {
        self.lock()
            .entities
            .get(entity_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of every entity
    pub fn world(&self) -> World {
        self.lock()
            .entities
            .iter()
            .map(|(id, attributes)| (id.clone(), Value::Object(attributes.clone())))
            .collect()
    }

    /// Drop all entities.
    ///
    /// Listeners are not notified and stay registered.
    pub fn clear(&self) {
        let mut inner = self.lock();
        let count = inner.entities.len();
        inner.entities.clear();

        info!(entities = count, "World cleared");
    }

    /// Register a listener for all future mutations
    pub fn add_listener<L>(&self, listener: L)
    where
        L: MutationListener + 'static,
    {
        self.lock().listeners.push(Arc::new(listener));
    }

    /// Number of entities currently stored
    pub fn len(&self) -> usize {
        self.lock().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}
