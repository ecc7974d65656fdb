use crate::state::EntityStore;
use crate::subscription::{ConnectionSession, SubscriberRegistry};
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use std::sync::Arc;
use tracing::info;

/// Shared application state for WebSocket handler
#[derive(Clone)]
pub struct WsAppState {
    pub store: Arc<EntityStore>,
    pub registry: Arc<SubscriberRegistry>,
}

/// GET /subscribe - WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<WsAppState>>) -> Response {
    info!("WebSocket upgrade request received");
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Create WebSocket router
pub fn create_ws_router(state: Arc<WsAppState>) -> Router {
    Router::new()
        .route("/subscribe", get(ws_handler))
        .with_state(state)
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<WsAppState>) {
    let session = ConnectionSession::new(Arc::clone(&state.store), Arc::clone(&state.registry));
    session.run(socket).await;
}
