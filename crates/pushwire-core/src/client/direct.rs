//! Direct (raw socket) client.

use pushwire_transport::{Connection, ConnectionId, TransportKind};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Client, ClientCore, ClientExtra, LifecycleState};
use crate::listener::ConnectionListener;
use crate::payload::Payload;

/// Stops the server-side reader of the socket.
#[derive(Default)]
pub(crate) struct Reader(Option<CancellationToken>);

impl ClientExtra for Reader {
    fn on_teardown(&mut self) {
        if let Some(token) = self.0.take() {
            token.cancel();
        }
    }
}

/// A thick client on a duplex socket speaking `@@@@`-delimited text.
///
/// Nothing is buffered: a send while not connected is dropped.
pub struct DirectClient {
    core: ClientCore<Reader>,
}

impl DirectClient {
    /// Create a new client.
    #[must_use]
    pub fn new(uid: impl Into<String>, listener: Weak<dyn ConnectionListener>) -> Arc<Self> {
        let uid = uid.into();
        Arc::new_cyclic(|me: &Weak<Self>| {
            let me: Weak<dyn Client> = me.clone();
            Self {
                core: ClientCore::new(uid, TransportKind::Direct, listener, me, Reader::default()),
            }
        })
    }
}

impl Client for DirectClient {
    fn uid(&self) -> &str {
        self.core.uid()
    }

    fn transport(&self) -> TransportKind {
        self.core.kind()
    }

    fn state(&self) -> LifecycleState {
        self.core.state()
    }

    fn subscriptions(&self) -> Vec<String> {
        self.core.subscriptions()
    }

    fn is_subscribed(&self, topic: &str) -> bool {
        self.core.is_subscribed(topic)
    }

    fn add_subscription(&self, topic: &str) -> bool {
        self.core.add_subscription(topic)
    }

    fn remove_subscription(&self, topic: &str) -> bool {
        self.core.remove_subscription(topic)
    }

    fn set_connection(&self, connection: Arc<dyn Connection>) {
        self.core.set_connection(connection);
    }

    fn connection_id(&self) -> Option<ConnectionId> {
        self.core.connection_id()
    }

    fn set_reader(&self, reader: CancellationToken) {
        let mut inner = self.core.lock();
        if inner.state == LifecycleState::Destroyed {
            reader.cancel();
            return;
        }
        // A reader from an older socket must not keep feeding this client.
        if let Some(previous) = inner.extra.0.replace(reader) {
            previous.cancel();
        }
    }

    fn on_connect(&self) {
        self.core.on_connect();
    }

    fn send(&self, topic: &str, payload: &Arc<Payload>) {
        let uid = self.core.uid();
        let notice = {
            let mut inner = self.core.lock();
            if !inner.writable() {
                debug!(client = %uid, topic = %topic, "Not connected, dropping message");
                return;
            }
            let bytes = payload.stamped().to_direct_bytes();
            inner.write(uid, bytes)
        };
        self.core.notify(notice);
    }

    fn disconnect(&self) {
        self.core.disconnect();
    }

    fn lost_connection(&self) {
        self.core.lost_connection();
    }

    fn queued_messages(&self) -> String {
        warn!(client = %self.core.uid(), "queued_messages called on a direct client");
        String::new()
    }

    fn destroy(&self) -> Option<Vec<String>> {
        self.core.destroy()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{weak, RecordingListener};
    use super::*;
    use pushwire_protocol::DirectParser;
    use pushwire_transport::MemoryConnection;

    #[test]
    fn test_send_is_delimited() {
        let client = DirectClient::new("u1", crate::listener::detached());
        let conn = Arc::new(MemoryConnection::new("c1"));
        client.set_connection(conn.clone());
        client.on_connect();

        client.send("A", &Arc::new(Payload::new("A")));
        client.send("A", &Arc::new(Payload::new("A").with_field("x", "1")));

        let messages = DirectParser::new().push(&conn.concat());
        assert_eq!(
            messages,
            vec![r#"{"topic":"A"}"#, r#"{"topic":"A","x":"1"}"#]
        );
    }

    #[test]
    fn test_send_dropped_when_not_connected() {
        let client = DirectClient::new("u1", crate::listener::detached());
        let conn = Arc::new(MemoryConnection::new("c1"));
        client.set_connection(conn.clone());

        client.send("A", &Arc::new(Payload::new("A")));
        assert!(conn.written().is_empty());
        assert_eq!(client.queued_messages(), "");
    }

    #[test]
    fn test_teardown_cancels_reader() {
        let listener = Arc::new(RecordingListener::default());
        let client = DirectClient::new("u1", weak(&listener));
        let token = CancellationToken::new();
        client.set_reader(token.clone());
        client.on_connect();

        client.lost_connection();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_new_reader_cancels_previous() {
        let client = DirectClient::new("u1", crate::listener::detached());
        let first = CancellationToken::new();
        let second = CancellationToken::new();
        client.set_reader(first.clone());
        client.set_reader(second.clone());

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        client.disconnect();
        assert!(second.is_cancelled());
    }

    #[test]
    fn test_write_failure_loses_connection() {
        let listener = Arc::new(RecordingListener::default());
        let client = DirectClient::new("u1", weak(&listener));
        let conn = Arc::new(MemoryConnection::new("c1"));
        client.set_connection(conn.clone());
        client.on_connect();

        conn.fail_io();
        client.send("A", &Arc::new(Payload::new("A")));
        client.send("A", &Arc::new(Payload::new("A")));

        assert_eq!(client.state(), LifecycleState::LostConnection);
        assert_eq!(listener.count("lost"), 1);
    }
}
