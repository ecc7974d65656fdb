use crate::state::EntityStore;
use crate::subscription::protocol::{parse_inbound, InboundMessage, ProtocolError};
use crate::subscription::SubscriberRegistry;
use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why a session ended
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEnd {
    /// Peer sent a close frame or the inbound stream ended
    PeerClosed,
    /// Transport error while reading
    ReadError(String),
    /// Inbound message could not be parsed
    Malformed(ProtocolError),
    /// Transport error while writing
    WriteError(String),
    /// Subscriber was removed from the registry while the session was running
    QueueClosed,
    /// Reader or writer task panicked
    TaskFailed(String),
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::PeerClosed => write!(f, "peer closed connection"),
            SessionEnd::ReadError(e) => write!(f, "read failed: {}", e),
            SessionEnd::Malformed(e) => write!(f, "malformed message: {}", e),
            SessionEnd::WriteError(e) => write!(f, "write failed: {}", e),
            SessionEnd::QueueClosed => write!(f, "subscriber queue closed"),
            SessionEnd::TaskFailed(e) => write!(f, "session task failed: {}", e),
        }
    }
}

/// How long the writer gets to send its close frame once the reader has ended
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Drives one WebSocket connection.
///
/// Registers a subscriber, then runs a reader task (inbound frames → store)
/// and a writer task (subscriber queue → peer) concurrently. When the reader
/// ends first, the writer is told to stop and closes the sink (which also
/// answers a peer-initiated close); when the writer ends first, the reader is
/// aborted. The subscriber is unregistered once both have stopped.
pub struct ConnectionSession {
    store: Arc<EntityStore>,
    registry: Arc<SubscriberRegistry>,
}

/// Reader and writer tasks of one session; both are aborted on drop, so
/// cancelling the session future stops them too.
struct SessionTasks {
    reader: JoinHandle<SessionEnd>,
    writer: JoinHandle<SessionEnd>,
}

impl Drop for SessionTasks {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl ConnectionSession {
    pub fn new(store: Arc<EntityStore>, registry: Arc<SubscriberRegistry>) -> Self {
        Self { store, registry }
    }

    /// Handle WebSocket connection lifecycle
    pub async fn run(self, socket: WebSocket) -> SessionEnd {
        let (sink, stream) = socket.split();
        self.run_split(sink, stream).await
    }

    /// Run over an already split transport
    pub async fn run_split<K, S, E>(self, sink: K, stream: S) -> SessionEnd
    where
        K: Sink<Message> + Unpin + Send + 'static,
        K::Error: fmt::Display + Send + 'static,
        S: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let (handle, queue) = self.registry.register();
        let subscriber_id = handle.id();

        info!(subscriber_id = %subscriber_id, "WebSocket session started");

        let (stop_tx, stop_rx) = oneshot::channel();
        let mut tasks = SessionTasks {
            reader: tokio::spawn(read_loop(stream, Arc::clone(&self.store), subscriber_id)),
            writer: tokio::spawn(write_loop(sink, queue, stop_rx, subscriber_id)),
        };

        let end = tokio::select! {
            result = &mut tasks.reader => {
                let _ = stop_tx.send(());
                if timeout(CLOSE_TIMEOUT, &mut tasks.writer).await.is_err() {
                    debug!(subscriber_id = %subscriber_id, "Writer did not close in time");
                    tasks.writer.abort();
                }
                task_result(result)
            }
            result = &mut tasks.writer => {
                // Dropping the reader's stream half cancels its pending receive
                tasks.reader.abort();
                let _ = (&mut tasks.reader).await;
                task_result(result)
            }
        };

        drop(tasks);
        drop(handle);

        match &end {
            SessionEnd::PeerClosed => {
                info!(subscriber_id = %subscriber_id, "WebSocket session closed")
            }
            other => {
                warn!(subscriber_id = %subscriber_id, reason = %other, "WebSocket session terminated")
            }
        }

        end
    }
}

fn task_result(result: Result<SessionEnd, JoinError>) -> SessionEnd {
    result.unwrap_or_else(|e| SessionEnd::TaskFailed(e.to_string()))
}

/// Apply inbound messages to the store until the peer goes away
async fn read_loop<S, E>(mut stream: S, store: Arc<EntityStore>, subscriber_id: Uuid) -> SessionEnd
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(e) => {
                    return SessionEnd::Malformed(ProtocolError::InvalidJson(e.to_string()))
                }
            },
            Ok(Message::Close(_)) => return SessionEnd::PeerClosed,
            Ok(_) => {
                // Ping/pong are answered by the transport
                continue;
            }
            Err(e) => return SessionEnd::ReadError(e.to_string()),
        };

        match parse_inbound(&text) {
            Ok(InboundMessage::Handshake) => {
                debug!(subscriber_id = %subscriber_id, "Received handshake");
            }
            Ok(InboundMessage::Updates(updates)) => {
                for (entity_id, attributes) in updates {
                    store.set(&entity_id, attributes);
                }
            }
            Err(e) => return SessionEnd::Malformed(e),
        }
    }

    SessionEnd::PeerClosed
}

/// Drain the subscriber queue to the peer, in FIFO order.
///
/// On `stop` a close frame is sent and the loop ends; the session then
/// reports the reader's outcome, not this one.
async fn write_loop<K>(
    mut sink: K,
    mut queue: mpsc::UnboundedReceiver<String>,
    mut stop: oneshot::Receiver<()>,
    subscriber_id: Uuid,
) -> SessionEnd
where
    K: Sink<Message> + Unpin,
    K::Error: fmt::Display,
{
    loop {
        tokio::select! {
            message = queue.recv() => {
                let Some(message) = message else {
                    debug!(subscriber_id = %subscriber_id, "Subscriber queue closed");
                    return SessionEnd::QueueClosed;
                };
                if let Err(e) = sink.send(Message::Text(message)).await {
                    return SessionEnd::WriteError(e.to_string());
                }
            }
            _ = &mut stop => {
                // Also flushes the transport's reply to a peer-initiated close
                if let Err(e) = sink.send(Message::Close(None)).await {
                    debug!(subscriber_id = %subscriber_id, error = %e, "Close frame not delivered");
                }
                return SessionEnd::PeerClosed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Attributes;
    use crate::subscription::BroadcastListener;
    use futures::channel::mpsc as chan;
    use serde_json::{json, Value};

    type Inbound = chan::UnboundedSender<Result<Message, String>>;
    type Outbound = chan::UnboundedReceiver<Message>;

    const WAIT: Duration = Duration::from_secs(5);

    fn setup() -> (Arc<EntityStore>, Arc<SubscriberRegistry>) {
        let registry = Arc::new(SubscriberRegistry::new());
        let store = Arc::new(EntityStore::new());
        store.add_listener(BroadcastListener::new(Arc::clone(&registry)));
        (store, registry)
    }

    fn spawn_session(
        store: &Arc<EntityStore>,
        registry: &Arc<SubscriberRegistry>,
    ) -> (Inbound, Outbound, tokio::task::JoinHandle<SessionEnd>) {
        let (in_tx, in_rx) = chan::unbounded::<Result<Message, String>>();
        let (out_tx, out_rx) = chan::unbounded::<Message>();
        let session = ConnectionSession::new(Arc::clone(store), Arc::clone(registry));
        let handle = tokio::spawn(session.run_split(out_tx, in_rx));
        (in_tx, out_rx, handle)
    }

    async fn wait_for_subscribers(registry: &SubscriberRegistry, count: usize) {
        timeout(WAIT, async {
            while registry.len() != count {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("subscribers did not register");
    }

    fn text(value: Value) -> Result<Message, String> {
        Ok(Message::Text(value.to_string()))
    }

    async fn next_json(out: &mut Outbound) -> Value {
        match timeout(WAIT, out.next()).await.unwrap() {
            Some(Message::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_is_echoed_to_sender() {
        let (store, registry) = setup();
        store.set("5", json!({"x": 1, "y": 2}).as_object().cloned().unwrap());

        let (in_tx, mut out, handle) = spawn_session(&store, &registry);
        in_tx.unbounded_send(text(json!({"5": {"x": 3, "y": 2}}))).unwrap();

        assert_eq!(next_json(&mut out).await, json!({"5": {"x": 3, "y": 2}}));
        assert_eq!(store.get("5"), *json!({"x": 3, "y": 2}).as_object().unwrap());

        drop(in_tx);
        let end = timeout(WAIT, handle).await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::PeerClosed);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_update_fans_out_to_other_sessions() {
        let (store, registry) = setup();
        let (a_in, mut a_out, _a) = spawn_session(&store, &registry);
        let (_b_in, mut b_out, _b) = spawn_session(&store, &registry);
        wait_for_subscribers(&registry, 2).await;

        a_in.unbounded_send(text(json!({"1": {"x": 1}}))).unwrap();
        a_in.unbounded_send(text(json!({"1": {"x": 2}}))).unwrap();

        for out in [&mut a_out, &mut b_out] {
            assert_eq!(next_json(out).await, json!({"1": {"x": 1}}));
            assert_eq!(next_json(out).await, json!({"1": {"x": 2}}));
        }
    }

    #[tokio::test]
    async fn test_multi_entity_message_sets_each_entity() {
        let (store, registry) = setup();
        let (in_tx, _out, handle) = spawn_session(&store, &registry);

        in_tx
            .unbounded_send(text(json!({"1": {"x": 1}, "2": {"y": 2}})))
            .unwrap();
        drop(in_tx);

        assert_eq!(timeout(WAIT, handle).await.unwrap().unwrap(), SessionEnd::PeerClosed);
        assert_eq!(store.world().len(), 2);
    }

    #[tokio::test]
    async fn test_handshake_is_not_applied() {
        let (store, registry) = setup();
        let (in_tx, out, handle) = spawn_session(&store, &registry);

        in_tx.unbounded_send(text(json!({"7": "HELLO"}))).unwrap();
        in_tx
            .unbounded_send(Ok(Message::Close(None)))
            .unwrap();

        assert_eq!(timeout(WAIT, handle).await.unwrap().unwrap(), SessionEnd::PeerClosed);
        assert!(store.world().is_empty());

        // Nothing was broadcast; the writer only closed the sink
        let sent: Vec<Message> = timeout(WAIT, out.collect()).await.unwrap();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], Message::Close(_)));
    }

    #[tokio::test]
    async fn test_peer_close_is_answered_with_close_frame() {
        let (store, registry) = setup();
        let (in_tx, mut out, handle) = spawn_session(&store, &registry);

        in_tx.unbounded_send(text(json!({"1": {"x": 1}}))).unwrap();
        assert_eq!(next_json(&mut out).await, json!({"1": {"x": 1}}));

        in_tx.unbounded_send(Ok(Message::Close(None))).unwrap();

        assert_eq!(timeout(WAIT, handle).await.unwrap().unwrap(), SessionEnd::PeerClosed);
        let rest: Vec<Message> = timeout(WAIT, out.collect()).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert!(matches!(rest[0], Message::Close(None)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_session_stops_reader() {
        let (store, registry) = setup();
        let (in_tx, _out, handle) = spawn_session(&store, &registry);
        wait_for_subscribers(&registry, 1).await;

        handle.abort();
        wait_for_subscribers(&registry, 0).await;

        // Reader task was aborted along with the session and dropped its stream half
        timeout(WAIT, async {
            while !in_tx.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("reader kept running after session was cancelled");

        assert!(in_tx.unbounded_send(text(json!({"1": {"x": 1}}))).is_err());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_message_tears_down() {
        let (store, registry) = setup();
        let (in_tx, _out, handle) = spawn_session(&store, &registry);

        in_tx
            .unbounded_send(Ok(Message::Text("[1, 2, 3]".to_string())))
            .unwrap();

        let end = timeout(WAIT, handle).await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::Malformed(ProtocolError::NotAnObject));
        assert!(registry.is_empty());
        // Reader dropped its stream half
        assert!(in_tx.is_closed());
    }

    #[tokio::test]
    async fn test_binary_frame_is_parsed_as_text() {
        let (store, registry) = setup();
        let (in_tx, _out, handle) = spawn_session(&store, &registry);

        let payload = json!({"3": {"r": 10}}).to_string().into_bytes();
        in_tx.unbounded_send(Ok(Message::Binary(payload))).unwrap();
        drop(in_tx);

        assert_eq!(timeout(WAIT, handle).await.unwrap().unwrap(), SessionEnd::PeerClosed);
        assert_eq!(store.get("3"), *json!({"r": 10}).as_object().unwrap());
    }

    #[tokio::test]
    async fn test_read_error_tears_down() {
        let (store, registry) = setup();
        let (in_tx, _out, handle) = spawn_session(&store, &registry);

        in_tx.unbounded_send(Err("connection reset".to_string())).unwrap();

        let end = timeout(WAIT, handle).await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::ReadError("connection reset".to_string()));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_cancels_pending_read() {
        let (store, registry) = setup();
        let (in_tx, out, handle) = spawn_session(&store, &registry);
        wait_for_subscribers(&registry, 1).await;

        // Peer gone on the outbound side; inbound side still open and idle
        drop(out);
        store.set("1", Attributes::new());

        let end = timeout(WAIT, handle).await.unwrap().unwrap();
        assert!(matches!(end, SessionEnd::WriteError(_)));
        assert!(registry.is_empty());
        assert!(in_tx.is_closed());
    }
}
