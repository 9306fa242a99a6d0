//! Inbound stream handling for the socket transports.
//!
//! A session owns one socket's accumulation parser and, once the peer has
//! sent `uid=<id>`, the client bound to it. Each complete message is decoded
//! into an [`Instruction`] and applied to the engine.

use pushwire_protocol::{DirectParser, FrameParser, Instruction};
use pushwire_transport::{Connection, Request, TransportKind};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::Client;
use crate::engine::SubscriptionEngine;
use crate::payload::{Payload, TOPIC_FIELD};

/// Default cap on bytes buffered while waiting for a message to complete.
pub const DEFAULT_MAX_PENDING: usize = 64 * 1024;

pub(crate) const READ_BUFFER_SIZE: usize = 4096;

/// Stream framing used by a session.
pub trait Framing: Default + Send {
    /// Transport that uses this framing.
    const TRANSPORT: TransportKind;

    /// Append bytes and return completed messages.
    fn push(&mut self, chunk: &[u8]) -> Vec<String>;

    /// Bytes buffered without a complete message.
    fn pending(&self) -> usize;
}

impl Framing for DirectParser {
    const TRANSPORT: TransportKind = TransportKind::Direct;

    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        DirectParser::push(self, chunk)
    }

    fn pending(&self) -> usize {
        DirectParser::pending(self)
    }
}

impl Framing for FrameParser {
    const TRANSPORT: TransportKind = TransportKind::WebSocket;

    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        FrameParser::push(self, chunk)
    }

    fn pending(&self) -> usize {
        FrameParser::pending(self)
    }
}

/// Whether the session wants more input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading.
    Continue,
    /// Stop reading; the connection is finished.
    Close,
}

/// One inbound socket stream.
pub struct Session<F: Framing> {
    engine: Arc<SubscriptionEngine>,
    connection: Arc<dyn Connection>,
    parser: F,
    client: Option<Arc<dyn Client>>,
    reader: CancellationToken,
    max_pending: usize,
}

/// Session for `@@@@`-delimited Direct sockets.
pub type DirectSession = Session<DirectParser>;

/// Session for `0x00 ... 0xFF` framed WebSocket streams.
pub type WebSocketSession = Session<FrameParser>;

impl<F: Framing> Session<F> {
    /// Create a session writing back through `connection`.
    #[must_use]
    pub fn new(engine: Arc<SubscriptionEngine>, connection: Arc<dyn Connection>) -> Self {
        Self {
            engine,
            connection,
            parser: F::default(),
            client: None,
            reader: CancellationToken::new(),
            max_pending: DEFAULT_MAX_PENDING,
        }
    }

    /// Cap the bytes buffered for an incomplete message.
    #[must_use]
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    /// Token that stops [`run`](Self::run).
    #[must_use]
    pub fn reader(&self) -> CancellationToken {
        self.reader.clone()
    }

    /// The bound client, once the peer has identified itself.
    #[must_use]
    pub fn client(&self) -> Option<&Arc<dyn Client>> {
        self.client.as_ref()
    }

    /// The bound client identifier.
    #[must_use]
    pub fn uid(&self) -> Option<&str> {
        self.client.as_ref().map(|c| c.uid())
    }

    /// Feed raw bytes read from the socket.
    pub fn feed(&mut self, chunk: &[u8]) -> Flow {
        for message in self.parser.push(chunk) {
            if self.handle(&message) == Flow::Close {
                return Flow::Close;
            }
        }

        if self.parser.pending() > self.max_pending {
            warn!(
                connection = %self.connection.id(),
                pending = self.parser.pending(),
                limit = self.max_pending,
                "Inbound message too large, dropping connection"
            );
            self.finish();
            return Flow::Close;
        }
        Flow::Continue
    }

    /// Apply one complete message.
    pub fn handle(&mut self, message: &str) -> Flow {
        let instruction = Instruction::parse(message);
        debug!(
            connection = %self.connection.id(),
            client = self.uid().unwrap_or("-"),
            instruction = instruction.kind(),
            "Received"
        );

        match &instruction {
            Instruction::Connect { uid } => {
                self.connect(uid);
                return Flow::Continue;
            }
            Instruction::Unknown(raw) => {
                warn!(connection = %self.connection.id(), message = %raw, "Unknown instruction");
                return Flow::Continue;
            }
            _ => {}
        }

        let Some(client) = self.client.clone() else {
            warn!(
                connection = %self.connection.id(),
                instruction = instruction.kind(),
                "Instruction before uid, ignoring"
            );
            return Flow::Continue;
        };

        match instruction {
            Instruction::Subscribe(topics) => self.engine.subscribe_all(&client, &topics),
            Instruction::Unsubscribe(topics) => self.engine.unsubscribe_all(&client, &topics),
            Instruction::Publish { topic, payload } => {
                match Payload::from_url_encoded_json(&payload) {
                    Ok(mut payload) => {
                        if payload.get(TOPIC_FIELD).is_none() {
                            payload.add_field(TOPIC_FIELD, topic.as_str());
                        }
                        self.engine
                            .message_received(&client, &topic, Arc::new(payload));
                    }
                    Err(e) => {
                        warn!(client = %client.uid(), topic = %topic, error = %e, "Bad publish payload");
                    }
                }
            }
            Instruction::Disconnect => {
                client.disconnect();
                self.connection.close();
                return Flow::Close;
            }
            Instruction::Connect { .. } | Instruction::Unknown(_) => {}
        }
        Flow::Continue
    }

    fn connect(&mut self, uid: &str) {
        if let Some(bound) = &self.client {
            if bound.uid() != uid {
                warn!(
                    connection = %self.connection.id(),
                    bound = %bound.uid(),
                    requested = %uid,
                    "Connection already bound to another client"
                );
            }
            return;
        }

        let request =
            Request::new(uid, F::TRANSPORT).with_connection(Arc::clone(&self.connection));
        match self.engine.registry().find_or_create(&request) {
            Ok(client) => {
                client.set_reader(self.reader.clone());
                client.on_connect();
                self.client = Some(client);
            }
            Err(e) => {
                warn!(connection = %self.connection.id(), error = %e, "Cannot create client");
            }
        }
    }

    /// The stream ended. Loses the client's connection if it is still ours.
    pub fn finish(&mut self) {
        if let Some(client) = &self.client {
            if client.connection_id().as_ref() == Some(self.connection.id()) {
                client.lost_connection();
            }
        }
        self.connection.close();
    }

    /// Read from `reader` until the peer goes away, the session closes, or
    /// the reader token is cancelled.
    pub async fn run<R>(mut self, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let token = self.reader.clone();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let read = tokio::select! {
                () = token.cancelled() => {
                    debug!(connection = %self.connection.id(), "Reader cancelled");
                    break;
                }
                read = reader.read(&mut buf) => read,
            };

            match read {
                Ok(0) => {
                    debug!(connection = %self.connection.id(), "Peer closed stream");
                    break;
                }
                Ok(n) => {
                    if self.feed(&buf[..n]) == Flow::Close {
                        return;
                    }
                }
                Err(e) => {
                    debug!(connection = %self.connection.id(), error = %e, "Read failed");
                    break;
                }
            }

            if self.connection.is_closed() {
                break;
            }
        }

        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::LifecycleState;
    use crate::engine::EngineConfig;
    use parking_lot::Mutex;
    use pushwire_protocol::{direct, websocket};
    use pushwire_transport::MemoryConnection;
    use tokio::io::AsyncWriteExt;

    fn direct_session() -> (Arc<SubscriptionEngine>, Arc<MemoryConnection>, DirectSession) {
        let engine = SubscriptionEngine::new();
        let conn = Arc::new(MemoryConnection::new("d1"));
        let session = DirectSession::new(Arc::clone(&engine), conn.clone());
        (engine, conn, session)
    }

    #[test]
    fn test_direct_connect_and_subscribe() {
        let (engine, _, mut session) = direct_session();
        assert_eq!(
            session.feed(b"@@@@uid=u1@@@@@@@@subscribe=A, B@@@@"),
            Flow::Continue
        );

        let client = session.client().unwrap();
        assert_eq!(client.uid(), "u1");
        assert!(client.is_connected());
        assert_eq!(client.transport(), TransportKind::Direct);
        assert_eq!(engine.subscriber_count("A"), 1);
        assert_eq!(engine.subscriber_count("B"), 1);
    }

    #[test]
    fn test_split_chunks_are_reassembled() {
        let (engine, conn, mut session) = direct_session();
        session.feed(b"@@@@uid=u");
        session.feed(b"1@@");
        session.feed(b"@@@@@@subscribe=X@@");
        session.feed(b"@@");

        assert_eq!(engine.subscriber_count("X"), 1);
        engine.publish("X", Arc::new(Payload::new("X")));
        assert_eq!(
            DirectParser::new().push(&conn.concat()),
            vec![r#"{"topic":"X"}"#]
        );
    }

    #[test]
    fn test_instruction_before_uid_is_ignored() {
        let (engine, _, mut session) = direct_session();
        session.feed(b"@@@@subscribe=A@@@@");
        assert!(session.client().is_none());
        assert_eq!(engine.subscriber_count("A"), 0);
    }

    #[test]
    fn test_publish_reaches_listener_not_subscribers() {
        let (engine, conn, mut session) = direct_session();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.add_publish_listener(Arc::new(
            move |_client: &Arc<dyn Client>, topic: &str, payload: &Arc<Payload>| {
                sink.lock().push((topic.to_string(), payload.get("msg").map(String::from)));
            },
        ));

        session.feed(b"@@@@uid=u1@@@@@@@@subscribe=chat@@@@");
        session.feed(b"@@@@publish(chat,%7B%22msg%22%3A%22hi%22%7D)@@@@");

        assert_eq!(
            *seen.lock(),
            vec![("chat".to_string(), Some("hi".to_string()))]
        );
        assert!(conn.written().is_empty());
    }

    #[test]
    fn test_disconnect_closes_session() {
        let (engine, conn, mut session) = direct_session();
        session.feed(b"@@@@uid=u1@@@@@@@@subscribe=A@@@@");
        let reader = session.reader();

        assert_eq!(session.feed(b"@@@@disconnect@@@@"), Flow::Close);
        assert!(conn.is_closed());
        assert!(reader.is_cancelled());
        assert_eq!(engine.subscriber_count("A"), 0);
        assert!(engine.registry().is_empty());
    }

    #[test]
    fn test_oversized_input_drops_connection() {
        let engine = SubscriptionEngine::with_config(EngineConfig::default());
        let conn = Arc::new(MemoryConnection::new("d1"));
        let mut session =
            DirectSession::new(Arc::clone(&engine), conn.clone()).with_max_pending(16);

        assert_eq!(session.feed(b"@@@@uid=u1@@@@"), Flow::Continue);
        assert_eq!(session.feed(&[b'x'; 32]), Flow::Close);
        assert!(conn.is_closed());
    }

    #[test]
    fn test_websocket_session_binds_uid_from_first_frame() {
        let engine = SubscriptionEngine::new();
        let conn = Arc::new(MemoryConnection::new("w1"));
        let mut session = WebSocketSession::new(Arc::clone(&engine), conn.clone());

        let mut bytes = websocket::encode("uid=w").to_vec();
        bytes.extend_from_slice(&websocket::encode("subscribe=T"));
        session.feed(&bytes[..3]);
        assert!(session.client().is_none());
        session.feed(&bytes[3..]);

        assert_eq!(session.uid(), Some("w"));
        engine.publish("T", Arc::new(Payload::new("T")));
        assert_eq!(
            FrameParser::new().push(&conn.concat()),
            vec![r#"{"topic":"T"}"#]
        );
    }

    #[test]
    fn test_superseded_session_does_not_lose_new_connection() {
        let engine = SubscriptionEngine::new();
        let old = Arc::new(MemoryConnection::new("old"));
        let new = Arc::new(MemoryConnection::new("new"));
        let mut first = DirectSession::new(Arc::clone(&engine), old.clone());
        let mut second = DirectSession::new(Arc::clone(&engine), new.clone());

        first.feed(b"@@@@uid=u1@@@@");
        second.feed(b"@@@@uid=u1@@@@");
        assert!(first.reader().is_cancelled());

        first.finish();
        let client = second.client().unwrap();
        assert_eq!(client.state(), LifecycleState::Connected);
        assert!(old.is_closed());
        assert!(!new.is_closed());
    }

    #[tokio::test]
    async fn test_run_until_peer_closes() {
        let engine = SubscriptionEngine::new();
        let conn = Arc::new(MemoryConnection::new("d1"));
        let session = DirectSession::new(Arc::clone(&engine), conn.clone());
        let (mut peer, stream) = tokio::io::duplex(256);

        peer.write_all(&direct::encode("uid=u1")).await.unwrap();
        peer.write_all(&direct::encode("subscribe=A")).await.unwrap();
        drop(peer);

        session.run(stream).await;

        let client = engine.registry().find("u1").unwrap();
        assert_eq!(client.state(), LifecycleState::LostConnection);
        assert_eq!(engine.subscriber_count("A"), 1);
        assert_eq!(engine.stats().pending_purges, 1);
    }

    #[tokio::test]
    async fn test_run_stops_when_reader_cancelled() {
        let engine = SubscriptionEngine::new();
        let conn = Arc::new(MemoryConnection::new("d1"));
        let session = DirectSession::new(Arc::clone(&engine), conn.clone());
        let token = session.reader();
        let (_peer, stream) = tokio::io::duplex(256);

        token.cancel();
        session.run(stream).await;
        assert!(conn.is_closed());
    }
}
