// HTTP and WebSocket APIs

pub mod websocket;
pub mod world;

pub use websocket::{create_ws_router, ws_handler, WsAppState};
pub use world::{create_world_router, WorldAppState};

use crate::config::LiveWorldConfig;
use crate::state::EntityStore;
use crate::subscription::{BroadcastListener, SubscriberRegistry};
use axum::{response::Redirect, routing::get, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

/// Process-lifetime components shared by every handler and connection
#[derive(Clone)]
pub struct AppContext {
    pub store: Arc<EntityStore>,
    pub registry: Arc<SubscriberRegistry>,
}

impl AppContext {
    /// Create the store and registry, wiring mutation fan-out between them
    pub fn new() -> Self {
        let store = Arc::new(EntityStore::new());
        let registry = Arc::new(SubscriberRegistry::new());
        store.add_listener(BroadcastListener::new(Arc::clone(&registry)));

        Self { store, registry }
    }
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the full application router
pub fn create_app(ctx: &AppContext, config: &LiveWorldConfig) -> Router {
    let world_state = Arc::new(WorldAppState {
        store: Arc::clone(&ctx.store),
        max_body_bytes: config.api.max_body_bytes,
    });
    let ws_state = Arc::new(WsAppState {
        store: Arc::clone(&ctx.store),
        registry: Arc::clone(&ctx.registry),
    });

    Router::new()
        .route("/", get(|| async { Redirect::to("/static/index.html") }))
        .merge(create_world_router(world_state))
        .merge(create_ws_router(ws_state))
        .nest_service("/static", ServeDir::new(&config.server.static_dir))
        .layer(CorsLayer::permissive())
}
