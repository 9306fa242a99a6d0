//! Comet (HTTP streaming / long-poll) client.

use pushwire_protocol::comet;
use pushwire_transport::{Connection, ConnectionId, TransportKind};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use super::{Client, ClientCore, ClientExtra, Inner, LifecycleState, Notice};
use crate::listener::ConnectionListener;
use crate::message::Message;
use crate::payload::Payload;

/// Messages a Comet client holds while it has no response stream.
pub const DEFAULT_QUEUE_SIZE: usize = 1000;

pub(crate) struct CometQueue {
    messages: VecDeque<Message>,
    capacity: usize,
}

impl ClientExtra for CometQueue {
    fn on_destroy(&mut self) {
        self.messages.clear();
    }
}

impl Inner<CometQueue> {
    fn enqueue(&mut self, uid: &str, topic: &str, payload: &Arc<Payload>) -> Option<Notice> {
        if self.extra.messages.len() >= self.extra.capacity {
            warn!(
                client = %uid,
                topic = %topic,
                capacity = self.extra.capacity,
                "Comet queue full, dropping message"
            );
            return self.lose();
        }
        self.extra
            .messages
            .push_back(Message::new(topic, Arc::clone(payload)));
        None
    }

    /// Write queued messages in order until the queue is empty or a write
    /// fails. An unwritten message stays at the front.
    fn flush(&mut self, uid: &str) -> Option<Notice> {
        let mut flushed = 0usize;
        while self.writable() {
            let Some(message) = self.extra.messages.pop_front() else {
                break;
            };
            let bytes = message.payload.stamped().to_comet_bytes();
            if let Some(lost) = self.write(uid, bytes) {
                debug!(client = %uid, topic = %message.topic, flushed, "Flush interrupted");
                self.extra.messages.push_front(message);
                return Some(lost);
            }
            flushed += 1;
        }
        if flushed > 0 {
            debug!(client = %uid, flushed, "Flushed queued messages");
        }
        None
    }
}

/// A browser client reached through a streaming HTTP response.
///
/// Sends are queued until a response stream is bound and `on_connect` has
/// fired. A full queue drops the new message and loses the connection, so
/// the browser reconnects and drains what is left.
pub struct CometClient {
    core: ClientCore<CometQueue>,
}

impl CometClient {
    /// Create a client with the default queue size.
    #[must_use]
    pub fn new(uid: impl Into<String>, listener: Weak<dyn ConnectionListener>) -> Arc<Self> {
        Self::with_queue_size(uid, listener, DEFAULT_QUEUE_SIZE)
    }

    /// Create a client that queues at most `capacity` messages.
    #[must_use]
    pub fn with_queue_size(
        uid: impl Into<String>,
        listener: Weak<dyn ConnectionListener>,
        capacity: usize,
    ) -> Arc<Self> {
        let uid = uid.into();
        Arc::new_cyclic(|me: &Weak<Self>| {
            let me: Weak<dyn Client> = me.clone();
            Self {
                core: ClientCore::new(
                    uid,
                    TransportKind::Comet,
                    listener,
                    me,
                    CometQueue {
                        messages: VecDeque::new(),
                        capacity,
                    },
                ),
            }
        })
    }

    /// Number of queued messages.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.core.lock().extra.messages.len()
    }
}

impl Client for CometClient {
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

    fn on_connect(&self) {
        let uid = self.core.uid();
        let (connected, lost) = {
            let mut inner = self.core.lock();
            match inner.connect() {
                Some(connected) => (Some(connected), inner.flush(uid)),
                None => (None, None),
            }
        };
        self.core.notify(connected);
        self.core.notify(lost);
    }

    fn send(&self, topic: &str, payload: &Arc<Payload>) {
        let uid = self.core.uid();
        let notice = {
            let mut inner = self.core.lock();
            if inner.state == LifecycleState::Destroyed {
                debug!(client = %uid, topic = %topic, "Send to destroyed client ignored");
                None
            } else if inner.writable() {
                let bytes = payload.stamped().to_comet_bytes();
                inner.write(uid, bytes)
            } else {
                inner.enqueue(uid, topic, payload)
            }
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
        let texts: Vec<String> = self
            .core
            .lock()
            .extra
            .messages
            .drain(..)
            .map(|m| m.payload.stamped().to_text().to_owned())
            .collect();
        debug!(client = %self.core.uid(), count = texts.len(), "Drained queue for poll");
        comet::encode_batch(texts.iter().map(String::as_str))
    }

    fn destroy(&self) -> Option<Vec<String>> {
        self.core.destroy()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{weak, RecordingListener};
    use super::*;
    use pushwire_transport::MemoryConnection;

    fn payload(topic: &str, n: usize) -> Arc<Payload> {
        Arc::new(Payload::new(topic).with_field("n", n.to_string()))
    }

    #[test]
    fn test_queues_until_connected() {
        let client = CometClient::new("u1", crate::listener::detached());
        let conn = Arc::new(MemoryConnection::new("c1"));
        client.set_connection(conn.clone());

        client.send("A", &payload("A", 1));
        assert_eq!(client.queue_len(), 1);
        assert!(conn.written().is_empty());

        client.on_connect();
        assert_eq!(client.queue_len(), 0);
        assert_eq!(
            conn.written_text(),
            vec![r#"<script>x({"topic":"A","n":"1"});</script>"#]
        );
    }

    #[test]
    fn test_live_send_writes_script() {
        let client = CometClient::new("u1", crate::listener::detached());
        let conn = Arc::new(MemoryConnection::new("c1"));
        client.set_connection(conn.clone());
        client.on_connect();

        client.send("A", &Arc::new(Payload::new("A").with_field("price", "101.5")));
        let fields = comet::decode_scripts(&conn.written_text().concat()).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0]["topic"], "A");
        assert_eq!(fields[0]["price"], "101.5");
    }

    #[test]
    fn test_flush_preserves_fifo_order() {
        let client = CometClient::new("u1", crate::listener::detached());
        for n in 0..DEFAULT_QUEUE_SIZE {
            client.send("A", &payload("A", n));
        }
        assert_eq!(client.queue_len(), DEFAULT_QUEUE_SIZE);

        let conn = Arc::new(MemoryConnection::new("c1"));
        client.set_connection(conn.clone());
        client.on_connect();

        let body = conn.written_text().concat();
        let fields = comet::decode_scripts(&body).unwrap();
        assert_eq!(fields.len(), DEFAULT_QUEUE_SIZE);
        for (n, f) in fields.iter().enumerate() {
            assert_eq!(f["n"], n.to_string());
        }
        assert_eq!(client.queue_len(), 0);
    }

    #[test]
    fn test_overflow_loses_connection_once() {
        let listener = Arc::new(RecordingListener::default());
        let client = CometClient::with_queue_size("u1", weak(&listener), 3);
        for n in 0..5 {
            client.send("A", &payload("A", n));
        }

        assert_eq!(client.queue_len(), 3);
        assert_eq!(client.state(), LifecycleState::LostConnection);
        assert_eq!(listener.count("lost"), 1);
    }

    #[test]
    fn test_failed_flush_keeps_unsent_messages() {
        let listener = Arc::new(RecordingListener::default());
        let client = CometClient::new("u1", weak(&listener));
        client.send("A", &payload("A", 1));
        client.send("A", &payload("A", 2));

        let conn = Arc::new(MemoryConnection::new("c1"));
        conn.fail_closed();
        client.set_connection(conn);
        client.on_connect();

        assert_eq!(client.queue_len(), 2);
        assert_eq!(listener.count("connected"), 1);
        assert_eq!(listener.count("lost"), 1);
    }

    #[test]
    fn test_queued_messages_batch_and_clear() {
        let client = CometClient::new("u1", crate::listener::detached());
        client.send("A", &Arc::new(Payload::new("A")));
        client.send("B", &Arc::new(Payload::new("B")));

        assert_eq!(client.queued_messages(), r#"[{"topic":"A"},{"topic":"B"}]"#);
        assert_eq!(client.queue_len(), 0);
        assert_eq!(client.queued_messages(), "[]");
    }

    #[test]
    fn test_queued_messages_are_stamped() {
        let client = CometClient::new("u1", crate::listener::detached());
        let mut p = Payload::new("A");
        p.toggle_timestamping(true);
        client.send("A", &Arc::new(p));

        let batch = comet::decode_batch(&client.queued_messages()).unwrap();
        assert!(batch[0].contains_key("timestamp"));
    }

    #[test]
    fn test_write_failure_requeues_after_reconnect() {
        let client = CometClient::new("u1", crate::listener::detached());
        let conn = Arc::new(MemoryConnection::new("c1"));
        client.set_connection(conn.clone());
        client.on_connect();

        conn.fail_io();
        client.send("A", &payload("A", 1));
        assert_eq!(client.state(), LifecycleState::LostConnection);
        assert!(client.connection_id().is_none());

        client.send("A", &payload("A", 2));
        assert_eq!(client.queue_len(), 1);

        let fresh = Arc::new(MemoryConnection::new("c2"));
        client.set_connection(fresh.clone());
        client.on_connect();
        assert_eq!(fresh.written().len(), 1);
    }
}
