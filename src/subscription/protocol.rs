use crate::state::Attributes;
use serde_json::{Map, Value};
use std::fmt;

/// Handshake/keepalive token sent by clients as `{"<anything>": "HELLO"}`
pub const HANDSHAKE_TOKEN: &str = "HELLO";

/// Client → Server message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Liveness probe; never applied to the store
    Handshake,
    /// Entities to `set`, in message order
    Updates(Vec<(String, Attributes)>),
}

/// Inbound message errors. Any of these ends the session.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    InvalidJson(String),
    NotAnObject,
    InvalidAttributes(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidJson(e) => write!(f, "message is not valid JSON: {}", e),
            ProtocolError::NotAnObject => write!(f, "message must be a JSON object"),
            ProtocolError::InvalidAttributes(id) => {
                write!(f, "attributes for entity '{}' must be a JSON object", id)
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Parse an inbound text frame.
///
/// Format: `{"<entityId>": {<attribute>: <value>, ...}, ...}`. An object with
/// exactly one entry whose value is the string `"HELLO"` is a handshake.
pub fn parse_inbound(text: &str) -> Result<InboundMessage, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

    let entries = match value {
        Value::Object(entries) => entries,
        _ => return Err(ProtocolError::NotAnObject),
    };

    if is_handshake(&entries) {
        return Ok(InboundMessage::Handshake);
    }

    entries
        .into_iter()
        .map(|(entity_id, attributes)| match attributes {
            Value::Object(attributes) => Ok((entity_id, attributes)),
            _ => Err(ProtocolError::InvalidAttributes(entity_id)),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(InboundMessage::Updates)
}

fn is_handshake(entries: &Map<String, Value>) -> bool {
    entries.len() == 1
        && entries
            .values()
            .all(|v| v.as_str() == Some(HANDSHAKE_TOKEN))
}

/// Server → Client: `{"<entityId>": <attributes>}`
pub fn encode_update(entity_id: &str, attributes: &Attributes) -> String {
    let mut message = Map::with_capacity(1);
    message.insert(entity_id.to_string(), Value::Object(attributes.clone()));
    Value::Object(message).to_string()
}
