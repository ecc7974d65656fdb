// WebSocket subscribers and mutation fan-out

pub mod broadcast;
pub mod protocol;
pub mod registry;
pub mod session;

pub use broadcast::BroadcastListener;
pub use protocol::{encode_update, parse_inbound, InboundMessage, ProtocolError};
pub use registry::{Subscriber, SubscriberHandle, SubscriberRegistry};
pub use session::{ConnectionSession, SessionEnd};
