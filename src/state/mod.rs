// Shared world state and mutation notification

mod store;

pub use store::{Attributes, EntityStore, MutationListener, World};
