use crate::state::{Attributes, EntityStore, World};
use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// Shared state for the world/entity API
pub struct WorldAppState {
    pub store: Arc<EntityStore>,
    pub max_body_bytes: usize,
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Create world/entity API router
///
/// Request bodies are capped at `max_body_bytes` instead of axum's built-in
/// 2 MB default.
pub fn create_world_router(state: Arc<WorldAppState>) -> Router {
    let body_limit = DefaultBodyLimit::max(state.max_body_bytes);

    Router::new()
        .route("/world", get(world).post(world))
        .route(
            "/entity/:id",
            get(get_entity).post(set_entity).put(update_entity),
        )
        .route("/clear", get(clear).post(clear))
        .layer(body_limit)
        .with_state(state)
}

/// GET|POST /world - Snapshot of every entity
async fn world(State(state): State<Arc<WorldAppState>>) -> Json<World> {
    Json(state.store.world())
}

/// GET /entity/:id - Entity attributes (empty object if unknown)
async fn get_entity(
    State(state): State<Arc<WorldAppState>>,
    Path(id): Path<String>,
) -> Json<Attributes> {
    Json(state.store.get(&id))
}

/// POST /entity/:id - Replace entity attributes
async fn set_entity(
    State(state): State<Arc<WorldAppState>>,
    Path(id): Path<String>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<Attributes>, ApiError> {
    let attributes = parse_attributes(&body?)?;

    Ok(Json(state.store.set(&id, attributes)))
}

/// PUT /entity/:id - Merge attributes into the entity, one update per field
async fn update_entity(
    State(state): State<Arc<WorldAppState>>,
    Path(id): Path<String>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<Attributes>, ApiError> {
    let attributes = parse_attributes(&body?)?;

    let mut latest = None;
    for (key, value) in attributes {
        latest = Some(state.store.update(&id, &key, value));
    }

    // Empty body: nothing was written, report the current value
    Ok(Json(latest.unwrap_or_else(|| state.store.get(&id))))
}

/// GET|POST /clear - Drop every entity; returns the (empty) world
async fn clear(State(state): State<Arc<WorldAppState>>) -> Json<World> {
    state.store.clear();
    info!("World cleared via API");
    Json(state.store.world())
}

/// Parse a request body as an attribute object.
///
/// Content-Type is not checked; any body holding a JSON object is accepted.
fn parse_attributes(body: &Bytes) -> Result<Attributes, ApiError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| ApiError::InvalidJson(e.to_string()))?;

    match value {
        Value::Object(attributes) => Ok(attributes),
        _ => Err(ApiError::NotAnObject),
    }
}

/// World API error types
#[derive(Debug, PartialEq)]
enum ApiError {
    InvalidJson(String),
    NotAnObject,
    PayloadTooLarge,
    BodyRead(String),
}

impl From<BytesRejection> for ApiError {
    fn from(rejection: BytesRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge
        } else {
            ApiError::BodyRead(rejection.body_text())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ApiError::InvalidJson(msg) => (StatusCode::BAD_REQUEST, format!("invalid JSON: {}", msg)),
            ApiError::NotAnObject => (
                StatusCode::BAD_REQUEST,
                "body must be a JSON object".to_string(),
            ),
            ApiError::PayloadTooLarge => {
                (StatusCode::PAYLOAD_TOO_LARGE, "payload too large".to_string())
            }
            ApiError::BodyRead(msg) => (StatusCode::BAD_REQUEST, msg),
        };

        let body = Json(ErrorResponse {
            error: error_message,
        });

        (status, body).into_response()
    }
}
